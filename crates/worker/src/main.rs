//! Praxis Background Worker
//!
//! Handles scheduled billing maintenance:
//! - Expire abandoned checkouts (hourly)
//! - Apply period-end cancellations (every 15 minutes)
//! - Billing invariant checks (daily at 03:00 UTC)
//! - Commission due report for the previous month (1st of the month, 06:00 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use praxis_billing::{
    run_migrations, BillingPeriod, BillingService, InvariantCheckSummary, InvariantChecker,
    ViolationSeverity,
};
use praxis_shared::{create_pool, env_opt, init_tracing, PoolSettings};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Billing invariant check complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }
}

async fn run_minimal_mode() -> anyhow::Result<()> {
    info!("Worker running without billing jobs");
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        info!("Worker heartbeat (minimal mode)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before the filter is read
    dotenvy::dotenv().ok();
    init_tracing("info");

    info!("Starting Praxis Worker");

    let Some(database_url) = env_opt("DATABASE_URL") else {
        anyhow::bail!("DATABASE_URL must be set");
    };
    let pool = create_pool(&database_url, &PoolSettings::default()).await?;
    run_migrations(&pool).await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            return run_minimal_mode().await;
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire checkouts that stayed pending past the TTL
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                info!("Running stale checkout expiry job");
                match billing.expire_stale_pending().await {
                    Ok(expired) => info!(expired = expired.len(), "Stale checkout expiry complete"),
                    Err(e) => error!(error = %e, "Stale checkout expiry failed"),
                }
            })
        })?)
        .await?;
    info!(
        ttl_days = billing.config.pending_checkout_ttl.whole_days(),
        "Scheduled: Stale checkout expiry (hourly)"
    );

    // Job 2: Cancel soft-canceled subscriptions whose period ended
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing.apply_period_end_cancellations().await {
                    Ok(canceled) if canceled.is_empty() => {}
                    Ok(canceled) => info!(
                        canceled = canceled.len(),
                        "Period-end cancellations applied"
                    ),
                    Err(e) => error!(error = %e, "Period-end cancellation sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Period-end cancellation sweep (every 15 minutes)");

    // Job 3: Billing invariants
    let checker = Arc::new(InvariantChecker::new(pool.clone(), &billing.config.commission));
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (03:00 UTC)");

    // Job 4: Commissions due for last month, consumed by the payout run
    let report_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 6 1 * *", move |_uuid, _l| {
            let billing = report_billing.clone();
            Box::pin(async move {
                let period = BillingPeriod::containing(OffsetDateTime::now_utc()).previous();
                info!(period = %period, "Running commission due report");
                match billing.commission_report(period).await {
                    Ok(due) => {
                        let total_cents: i64 = due.iter().map(|c| c.monthly_amount_cents).sum();
                        for commission in &due {
                            info!(
                                period = %period,
                                commission_id = %commission.id,
                                referrer_id = %commission.referrer_id,
                                referred_id = %commission.referred_id,
                                amount_cents = commission.monthly_amount_cents,
                                "Commission due"
                            );
                        }
                        info!(
                            period = %period,
                            commissions = due.len(),
                            total_cents = total_cents,
                            "Commission due report complete"
                        );
                    }
                    Err(e) => error!(period = %period, error = %e, "Commission due report failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Commission due report (1st of month, 06:00 UTC)");

    // Job 5: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Praxis Worker started successfully with {} scheduled jobs", 5);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    let mut scheduler = scheduler;
    scheduler.shutdown().await?;

    Ok(())
}
