mod common;

use chrono::Duration;
use library_payments::{
    clock::Clock,
    domain::{CallbackRetryStatus, PaymentStatus},
    repository::{CallbackRetryRepository, PaymentRepository, SqliteCallbackRetryRepository, SqlitePaymentRepository},
    worker::{Worker, EXPIRED_ERROR_CODE},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_expiry_sweep() -> anyhow::Result<()> {
    let pool = common::test_pool().await?;
    let clock = common::manual_clock();
    let repo = Arc::new(SqlitePaymentRepository::new(pool.clone()));
    let settings = common::settings();
    let ctx = common::context(pool, repo.clone(), Arc::new(common::StubGateway::default()), clock.clone(), &settings);
    let worker = Worker::new(&ctx, settings.worker.clone());
    let now = clock.now();

    let mut stale = common::payment("600000000001", PaymentStatus::Pending, now - Duration::minutes(31));
    stale.expires_at = now - Duration::seconds(1);
    let stale = repo.create(stale).await?;

    let mut stale_processing = common::payment("600000000002", PaymentStatus::Processing, now - Duration::hours(1));
    stale_processing.expires_at = now - Duration::minutes(30);
    let stale_processing = repo.create(stale_processing).await?;

    let mut fresh = common::payment("600000000003", PaymentStatus::Pending, now);
    fresh.expires_at = now + Duration::hours(1);
    let fresh = repo.create(fresh).await?;

    let report = worker.expire_payments().await?;
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 2);
    assert!(report.errors.is_empty());

    for id in [stale.id, stale_processing.id] {
        let expired = repo.find_by_id(id).await?.unwrap();
        assert_eq!(expired.status, PaymentStatus::Failed);
        assert_eq!(expired.error_code.as_deref(), Some(EXPIRED_ERROR_CODE));
        assert!(expired.completed_at.is_none());
    }
    assert_eq!(repo.find_by_id(fresh.id).await?.unwrap(), fresh);

    // Nothing left to do on the next pass.
    assert_eq!(worker.expire_payments().await?.processed, 0);
    Ok(())
}

#[tokio::test]
async fn test_retry_sweep_applies_queued_callback() -> anyhow::Result<()> {
    let pool = common::test_pool().await?;
    let clock = common::manual_clock();
    let flaky = Arc::new(common::FlakyPayments::new(pool.clone(), 1));
    let retries = SqliteCallbackRetryRepository::new(pool.clone());
    let settings = common::settings();
    let ctx = common::context(pool, flaky.clone(), Arc::new(common::StubGateway::default()), clock.clone(), &settings);
    let worker = Worker::new(&ctx, settings.worker.clone());

    let payment = flaky
        .create(common::payment("700000000001", PaymentStatus::Pending, clock.now()))
        .await?;
    ctx.payment_service
        .process_callback(&common::callback_json("ok", "success", &payment.invoice_id))
        .await?;
    let entry = retries.find_active_by_invoice(&payment.invoice_id).await?.unwrap();

    // Not due yet.
    let report = worker.process_callback_retries().await?;
    assert_eq!(report.processed, 0);

    clock.advance(Duration::minutes(1));
    let report = worker.process_callback_retries().await?;
    assert_eq!(report.processed, 1);
    assert_eq!(report.succeeded, 1);

    let done = retries.find_by_id(entry.id).await?.unwrap();
    assert_eq!(done.status, CallbackRetryStatus::Completed);
    assert!(done.next_retry_at.is_none());

    let completed = flaky.find_by_id(payment.id).await?.unwrap();
    assert_eq!(completed.status, PaymentStatus::Completed);
    assert!(completed.completed_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_retry_sweep_exhausts_and_backs_off() -> anyhow::Result<()> {
    let pool = common::test_pool().await?;
    let clock = common::manual_clock();
    // Every write fails: the queued callback can never be applied.
    let flaky = Arc::new(common::FlakyPayments::new(pool.clone(), usize::MAX));
    let retries = SqliteCallbackRetryRepository::new(pool.clone());
    let settings = common::settings();
    let ctx = common::context(pool, flaky.clone(), Arc::new(common::StubGateway::default()), clock.clone(), &settings);
    let worker = Worker::new(&ctx, settings.worker.clone());

    let payment = flaky
        .create(common::payment("800000000001", PaymentStatus::Processing, clock.now()))
        .await?;
    ctx.payment_service
        .process_callback(&common::callback_json("ok", "success", &payment.invoice_id))
        .await?;
    let id = retries.find_active_by_invoice(&payment.invoice_id).await?.unwrap().id;

    // Attempt 1 after 1m, attempt 2 after a further 5m.
    clock.advance(Duration::minutes(1));
    let report = worker.process_callback_retries().await?;
    assert_eq!(report.failed, 1);
    let entry = retries.find_by_id(id).await?.unwrap();
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.status, CallbackRetryStatus::Pending);
    assert_eq!(entry.next_retry_at, Some(clock.now() + Duration::minutes(5)));

    clock.advance(Duration::minutes(4));
    assert_eq!(worker.process_callback_retries().await?.processed, 0);

    clock.advance(Duration::minutes(1));
    worker.process_callback_retries().await?;
    let entry = retries.find_by_id(id).await?.unwrap();
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.next_retry_at, Some(clock.now() + Duration::minutes(15)));

    // Third failure with max_retries = 3 ends it.
    clock.advance(Duration::minutes(15));
    worker.process_callback_retries().await?;
    let entry = retries.find_by_id(id).await?.unwrap();
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.status, CallbackRetryStatus::Failed);
    assert!(entry.next_retry_at.is_none());
    assert!(entry.last_error.is_some());

    clock.advance(Duration::days(2));
    assert_eq!(worker.process_callback_retries().await?.processed, 0);

    // Left for an operator, not forced into a final status.
    assert_eq!(
        flaky.find_by_id(payment.id).await?.unwrap().status,
        PaymentStatus::Processing
    );
    Ok(())
}

#[tokio::test]
async fn test_retry_sweep_drops_permanent_failures() -> anyhow::Result<()> {
    let pool = common::test_pool().await?;
    let clock = common::manual_clock();
    let flaky = Arc::new(common::FlakyPayments::new(pool.clone(), 1));
    let retries = SqliteCallbackRetryRepository::new(pool.clone());
    let settings = common::settings();
    let ctx = common::context(pool, flaky.clone(), Arc::new(common::StubGateway::default()), clock.clone(), &settings);
    let worker = Worker::new(&ctx, settings.worker.clone());

    let payment = flaky
        .create(common::payment("900000000001", PaymentStatus::Pending, clock.now()))
        .await?;
    ctx.payment_service
        .process_callback(&common::callback_json("ok", "success", &payment.invoice_id))
        .await?;
    let id = retries.find_active_by_invoice(&payment.invoice_id).await?.unwrap().id;

    // Meanwhile the payment expired and failed.
    clock.advance(Duration::minutes(31));
    worker.expire_payments().await?;

    let report = worker.process_callback_retries().await?;
    assert_eq!(report.failed, 1);
    let entry = retries.find_by_id(id).await?.unwrap();
    assert_eq!(entry.status, CallbackRetryStatus::Failed);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(
        flaky.find_by_id(payment.id).await?.unwrap().status,
        PaymentStatus::Failed
    );
    Ok(())
}

#[tokio::test]
async fn test_worker_loops_stop_on_cancel() -> anyhow::Result<()> {
    let pool = common::test_pool().await?;
    let clock = common::manual_clock();
    let repo = Arc::new(SqlitePaymentRepository::new(pool.clone()));
    let settings = common::settings();
    let ctx = common::context(pool, repo.clone(), Arc::new(common::StubGateway::default()), clock.clone(), &settings);
    let worker = Arc::new(Worker::new(&ctx, settings.worker.clone()));

    let mut stale = common::payment("990000000001", PaymentStatus::Pending, clock.now() - Duration::hours(1));
    stale.expires_at = clock.now() - Duration::minutes(1);
    let stale = repo.create(stale).await?;

    let shutdown = CancellationToken::new();
    let handles = worker.start(shutdown.clone());

    // The first tick fires immediately.
    let mut expired = false;
    for _ in 0..50 {
        if repo.find_by_id(stale.id).await?.unwrap().status == PaymentStatus::Failed {
            expired = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(expired);

    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(std::time::Duration::from_secs(5), handle).await??;
    }
    Ok(())
}
