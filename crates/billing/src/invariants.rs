//! Billing Invariants Module
//!
//! Runnable consistency checks over the Postgres schema. They only read,
//! and are safe to run at any time, including while webhooks are being
//! replayed.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::CommissionConfig;
use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or access is wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleOpenRow {
    user_id: Uuid,
    open_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnpaidActiveRow {
    sub_id: Uuid,
    user_id: Uuid,
    correlation_id: Option<String>,
    activated_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoTimestampRow {
    sub_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UnderThresholdRow {
    referrer_id: Uuid,
    active_commissions: i64,
    qualifying_referrals: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NonPositiveAmountRow {
    transaction_id: Uuid,
    user_id: Uuid,
    provider_transaction_id: String,
    amount_cents: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
    commission_threshold: i64,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, commissions: &CommissionConfig) -> Self {
        Self {
            pool,
            commission_threshold: commissions.qualifying_threshold as i64,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_open_subscription().await?);
        violations.extend(self.check_active_has_transaction().await?);
        violations.extend(self.check_canceled_has_canceled_at().await?);
        violations.extend(self.check_commission_threshold().await?);
        violations.extend(self.check_positive_ledger_amounts().await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// At most one non-canceled subscription per user.
    ///
    /// The partial unique index should make this impossible; a hit means the
    /// index is missing.
    async fn check_single_open_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleOpenRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as open_count
            FROM subscriptions
            WHERE status <> 'canceled'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_open_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} open subscriptions (expected at most 1)",
                    row.open_count
                ),
                context: serde_json::json!({
                    "open_count": row.open_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Every active subscription was paid for at least once
    async fn check_active_has_transaction(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnpaidActiveRow> = sqlx::query_as(
            r#"
            SELECT
                s.id as sub_id,
                s.user_id,
                s.correlation_id,
                s.activated_at
            FROM subscriptions s
            WHERE s.status = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM payment_transactions t
                  WHERE t.subscription_id = s.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_has_transaction".to_string(),
                user_ids: vec![row.user_id],
                description: "Active subscription has no ledger entry".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "correlation_id": row.correlation_id,
                    "activated_at": row.activated_at,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_canceled_has_canceled_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id
            FROM subscriptions
            WHERE status = 'canceled'
              AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_canceled_at".to_string(),
                user_ids: vec![row.user_id],
                description: "Canceled subscription has no canceled_at".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Referrers with active commissions have at least the threshold of
    /// referred users whose subscription was activated at some point.
    async fn check_commission_threshold(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnderThresholdRow> = sqlx::query_as(
            r#"
            WITH active AS (
                SELECT referrer_id, COUNT(*) as active_commissions
                FROM commissions
                WHERE status = 'active'
                GROUP BY referrer_id
            ),
            qualifying AS (
                SELECT u.referred_by as referrer_id, COUNT(DISTINCT s.user_id) as qualifying_referrals
                FROM users u
                JOIN subscriptions s ON s.user_id = u.id AND s.activated_at IS NOT NULL
                WHERE u.referred_by IS NOT NULL
                GROUP BY u.referred_by
            )
            SELECT
                a.referrer_id,
                a.active_commissions,
                COALESCE(q.qualifying_referrals, 0) as qualifying_referrals
            FROM active a
            LEFT JOIN qualifying q ON q.referrer_id = a.referrer_id
            WHERE COALESCE(q.qualifying_referrals, 0) < $1
            "#,
        )
        .bind(self.commission_threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "commission_threshold".to_string(),
                user_ids: vec![row.referrer_id],
                description: format!(
                    "Referrer has {} active commissions but only {} qualifying referrals (threshold {})",
                    row.active_commissions, row.qualifying_referrals, self.commission_threshold
                ),
                context: serde_json::json!({
                    "active_commissions": row.active_commissions,
                    "qualifying_referrals": row.qualifying_referrals,
                    "threshold": self.commission_threshold,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_positive_ledger_amounts(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NonPositiveAmountRow> = sqlx::query_as(
            r#"
            SELECT
                id as transaction_id,
                user_id,
                provider_transaction_id,
                amount_cents
            FROM payment_transactions
            WHERE amount_cents <= 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "positive_ledger_amounts".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Ledger entry '{}' has non-positive amount {}",
                    row.provider_transaction_id, row.amount_cents
                ),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "provider_transaction_id": row.provider_transaction_id,
                    "amount_cents": row.amount_cents,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_open_subscription" => self.check_single_open_subscription().await,
            "active_has_transaction" => self.check_active_has_transaction().await,
            "canceled_has_canceled_at" => self.check_canceled_has_canceled_at().await,
            "commission_threshold" => self.check_commission_threshold().await,
            "positive_ledger_amounts" => self.check_positive_ledger_amounts().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_open_subscription",
            "active_has_transaction",
            "canceled_has_canceled_at",
            "commission_threshold",
            "positive_ledger_amounts",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            user_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_open_subscription"));
        assert!(checks.contains(&"commission_threshold"));
    }

    #[test]
    fn test_summary_counts_failed_checks_not_rows() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            vec![
                violation("active_has_transaction"),
                violation("active_has_transaction"),
                violation("commission_threshold"),
            ],
        );

        assert_eq!(summary.checks_run, 5);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 5);
    }
}
