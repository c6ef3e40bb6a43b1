//! Integration tests for the survey job manager

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use tally_queue::{
    CustomerFilters, DateRange, ErpCustomersPayload, JobKind, JobManager, JobOptions, JobQueue,
    JobStatus, ManualNumbersPayload, MemoryStore, Producer,
};

fn manager() -> JobManager {
    JobManager::new(Arc::new(JobQueue::new(
        Arc::new(MemoryStore::new()),
        "whatsapp-surveys",
    )))
}

#[tokio::test]
async fn test_erp_job_uses_kind_defaults() {
    let manager = manager();
    let filters = CustomerFilters {
        date_range: Some(DateRange {
            start_date: "2024-01-01".into(),
            end_date: "2024-01-31".into(),
        }),
        country: Some("CO".into()),
        ..Default::default()
    };

    let id = manager
        .add_erp_customers_job("siigo", "nps-q1", filters.clone(), JobOptions::new())
        .await
        .unwrap();
    assert!(id.starts_with("process_erp_customers_"));

    let job = manager.get_job_status(&id).await.unwrap().unwrap();
    assert_eq!(job.job_type, JobKind::ErpCustomers.as_str());
    assert_eq!(job.priority, 5);
    assert_eq!(job.max_attempts, 3);

    let payload: ErpCustomersPayload = serde_json::from_value(job.payload).unwrap();
    assert_eq!(payload.erp_config_name, "siigo");
    assert_eq!(payload.limit, 1000);
    assert_eq!(payload.filters, filters);
}

#[tokio::test]
async fn test_caller_options_override_defaults() {
    let manager = manager();
    let id = manager
        .add_survey_batch_job(
            "nps-q1",
            vec!["+573001112233".into()],
            JobOptions::new().with_priority(9),
        )
        .await
        .unwrap();

    let job = manager.get_job_status(&id).await.unwrap().unwrap();
    assert_eq!(job.priority, 9);
    assert_eq!(job.max_attempts, 2);
}

#[tokio::test]
async fn test_manual_numbers_payload() {
    let manager = manager();
    let numbers = vec!["+15550001".to_string(), "+15550002".to_string()];
    let id = manager
        .add_manual_numbers_job("csat", numbers.clone(), JobOptions::new())
        .await
        .unwrap();

    let job = manager.get_job_status(&id).await.unwrap().unwrap();
    let payload: ManualNumbersPayload = serde_json::from_value(job.payload).unwrap();
    assert_eq!(payload.survey_id, "csat");
    assert_eq!(payload.phone_numbers, numbers);
}

#[tokio::test]
async fn test_listing_and_stats() {
    let manager = manager();
    for i in 0..12 {
        manager
            .add_survey_batch_job(&format!("s{}", i), vec![], JobOptions::new())
            .await
            .unwrap();
    }
    manager
        .add_manual_numbers_job(
            "later",
            vec![],
            JobOptions::new().with_delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    let stats = manager.get_queue_stats().await.unwrap();
    assert_eq!(stats.waiting, 12);
    assert_eq!(stats.delayed, 1);

    assert_eq!(manager.recent_jobs(JobStatus::Waiting).await.unwrap().len(), 10);
    assert_eq!(
        manager.get_jobs(JobStatus::Waiting, 0, -1).await.unwrap().len(),
        12
    );
    assert_eq!(manager.recent_jobs(JobStatus::Delayed).await.unwrap().len(), 1);
    assert!(manager.get_job_status("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_recent_waiting_jobs_follow_dequeue_order() {
    let manager = manager();
    for i in 0..10 {
        manager
            .add_survey_batch_job(&format!("s{}", i), vec![], JobOptions::new())
            .await
            .unwrap();
    }
    let urgent = manager
        .add_manual_numbers_job("urgent", vec!["+573001112233".into()], JobOptions::new())
        .await
        .unwrap();

    let recent = manager.recent_jobs(JobStatus::Waiting).await.unwrap();
    assert_eq!(recent.len(), 10);
    assert_eq!(recent[0].id, urgent);
    assert_eq!(recent[0].priority, 5);
    assert!(recent[1..].iter().all(|job| job.priority == 3));

    let next = manager.queue().dequeue_next().await.unwrap().unwrap();
    assert_eq!(next.id, urgent);
}

#[tokio::test]
async fn test_clean_old_jobs_reports_both_statuses() {
    let manager = manager();
    let queue = manager.queue().clone();
    for _ in 0..2 {
        manager
            .enqueue("t", json!({}), JobOptions::new().with_max_attempts(1))
            .await
            .unwrap();
    }

    let first = queue.dequeue_next().await.unwrap().unwrap();
    queue.complete_job(&first.id, json!(null)).await.unwrap();
    let second = queue.dequeue_next().await.unwrap().unwrap();
    queue.fail_job(&second.id, "no recipients").await.unwrap();

    let kept = manager.clean_old_jobs(Duration::from_secs(3600)).await.unwrap();
    assert_eq!((kept.completed, kept.failed), (0, 0));

    let report = manager.clean_old_jobs(Duration::ZERO).await.unwrap();
    assert_eq!((report.completed, report.failed), (1, 1));
    assert_eq!(manager.get_queue_stats().await.unwrap().total(), 0);
}
