//! Typed producer API for survey jobs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::QueueError;
use crate::job::{JobId, JobOptions, JobRecord, JobStatus};
use crate::queue::{JobQueue, Producer, QueueStats};

/// Age after which [`JobManager::clean_old_jobs`] prunes terminal jobs by default
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Rows returned by [`JobManager::recent_jobs`]
pub const DEFAULT_LIST_END: i64 = 9;

/// Queue name shared by the survey producers and workers
pub const DEFAULT_QUEUE_NAME: &str = "whatsapp-surveys";

fn default_limit() -> u32 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    ErpCustomers,
    ManualNumbers,
    SurveyBatch,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::ErpCustomers,
        JobKind::ManualNumbers,
        JobKind::SurveyBatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ErpCustomers => "process_erp_customers",
            JobKind::ManualNumbers => "process_manual_numbers",
            JobKind::SurveyBatch => "send_survey_batch",
        }
    }

    /// Kind for a job type tag, if it is one of the survey kinds.
    pub fn from_type(job_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == job_type)
    }

    /// Scheduling defaults; caller options override them field by field.
    pub fn default_options(&self) -> JobOptions {
        match self {
            JobKind::ErpCustomers | JobKind::ManualNumbers => {
                JobOptions::new().with_priority(5).with_max_attempts(3)
            }
            JobKind::SurveyBatch => JobOptions::new().with_priority(3).with_max_attempts(2),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount: Option<f64>,
}

/// Pull customers from a configured ERP and survey them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErpCustomersPayload {
    pub erp_config_name: String,
    pub survey_id: String,
    #[serde(default)]
    pub filters: CustomerFilters,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualNumbersPayload {
    pub survey_id: String,
    pub phone_numbers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyBatchPayload {
    pub survey_id: String,
    pub phone_numbers: Vec<String>,
}

/// Counts removed by [`JobManager::clean_old_jobs`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub completed: u64,
    pub failed: u64,
}

/// Facade over a [`JobQueue`] for upstream callers.
#[derive(Debug, Clone)]
pub struct JobManager {
    queue: Arc<JobQueue>,
}

impl JobManager {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    async fn add<P: Serialize>(
        &self,
        kind: JobKind,
        payload: &P,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let options = options.or_defaults(kind.default_options());
        self.queue.enqueue(kind.as_str(), payload, options).await
    }

    pub async fn add_erp_customers_job(
        &self,
        erp_config_name: &str,
        survey_id: &str,
        filters: CustomerFilters,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let payload = ErpCustomersPayload {
            erp_config_name: erp_config_name.to_string(),
            survey_id: survey_id.to_string(),
            filters,
            limit: default_limit(),
        };
        self.add(JobKind::ErpCustomers, &payload, options).await
    }

    pub async fn add_manual_numbers_job(
        &self,
        survey_id: &str,
        phone_numbers: Vec<String>,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let payload = ManualNumbersPayload {
            survey_id: survey_id.to_string(),
            phone_numbers,
        };
        self.add(JobKind::ManualNumbers, &payload, options).await
    }

    pub async fn add_survey_batch_job(
        &self,
        survey_id: &str,
        phone_numbers: Vec<String>,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let payload = SurveyBatchPayload {
            survey_id: survey_id.to_string(),
            phone_numbers,
        };
        self.add(JobKind::SurveyBatch, &payload, options).await
    }

    pub async fn get_job_status(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.queue.get_job(id).await
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        self.queue.stats().await
    }

    pub async fn get_jobs(
        &self,
        status: JobStatus,
        start: i64,
        end: i64,
    ) -> Result<Vec<JobRecord>, QueueError> {
        self.queue.list_by_status(status, start, end).await
    }

    /// First ten jobs of a status ordering
    pub async fn recent_jobs(&self, status: JobStatus) -> Result<Vec<JobRecord>, QueueError> {
        self.get_jobs(status, 0, DEFAULT_LIST_END).await
    }

    /// Prune completed and failed jobs older than `max_age` concurrently.
    pub async fn clean_old_jobs(&self, max_age: Duration) -> Result<CleanupReport, QueueError> {
        let (completed, failed) = futures::try_join!(
            self.queue.cleanup(JobStatus::Completed, max_age),
            self.queue.cleanup(JobStatus::Failed, max_age),
        )?;
        Ok(CleanupReport { completed, failed })
    }
}

#[async_trait]
impl Producer for JobManager {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.queue.enqueue(job_type, payload, options).await
    }
}
