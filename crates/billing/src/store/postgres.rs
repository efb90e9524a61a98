//! Postgres store
//!
//! Schema lives in `crates/billing/migrations`. The one-open-subscription
//! rule is enforced by a partial unique index, and the ledger's
//! exactly-once rule by a unique provider transaction id, so separate
//! processes sharing the database cannot break either.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::BillingStore;
use crate::commissions::{BillingPeriod, Commission};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::ledger::PaymentTransaction;
use crate::plans::{NewPlan, Plan, PlanCatalog};
use crate::subscriptions::{Subscription, SubscriptionStatus};

/// Apply pending migrations
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Database(format!("migration failed: {}", e)))
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, current_period_start, \
    current_period_end, cancel_at_period_end, payment_method, correlation_id, \
    customer_reference, activated_at, canceled_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, subscription_id, amount_cents, currency, \
    status, payment_method, provider_transaction_id, correlation_id, description, created_at";

const COMMISSION_COLUMNS: &str = "id, referrer_id, referred_id, subscription_id, \
    monthly_amount_cents, status, start_date, end_date, last_paid_period, created_at";

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    payment_method: String,
    correlation_id: Option<String>,
    customer_reference: Option<String>,
    activated_at: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            payment_method: row.payment_method.parse()?,
            correlation_id: row.correlation_id,
            customer_reference: row.customer_reference,
            activated_at: row.activated_at,
            canceled_at: row.canceled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    subscription_id: Uuid,
    amount_cents: i64,
    currency: String,
    status: String,
    payment_method: String,
    provider_transaction_id: String,
    correlation_id: String,
    description: String,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(PaymentTransaction {
            id: row.id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: row.status.parse()?,
            payment_method: row.payment_method.parse()?,
            provider_transaction_id: row.provider_transaction_id,
            correlation_id: row.correlation_id,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommissionRow {
    id: Uuid,
    referrer_id: Uuid,
    referred_id: Uuid,
    subscription_id: Uuid,
    monthly_amount_cents: i64,
    status: String,
    start_date: OffsetDateTime,
    end_date: Option<OffsetDateTime>,
    last_paid_period: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<CommissionRow> for Commission {
    type Error = BillingError;

    fn try_from(row: CommissionRow) -> Result<Self, Self::Error> {
        Ok(Commission {
            id: row.id,
            referrer_id: row.referrer_id,
            referred_id: row.referred_id,
            subscription_id: row.subscription_id,
            monthly_amount_cents: row.monthly_amount_cents,
            status: row.status.parse()?,
            start_date: row.start_date,
            end_date: row.end_date,
            last_paid_period: row
                .last_paid_period
                .as_deref()
                .map(str::parse::<BillingPeriod>)
                .transpose()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    price_cents: i64,
    currency: String,
    billing_interval: String,
    features: Json<Vec<String>>,
    client_limit: Option<i32>,
    is_active: bool,
    sort_order: i32,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Plan {
            id: row.id,
            name: row.name,
            description: row.description,
            price_cents: row.price_cents,
            currency: row.currency,
            interval: row.billing_interval.parse()?,
            features: row.features.0,
            client_limit: row.client_limit,
            is_active: row.is_active,
            sort_order: row.sort_order,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_subscription_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND status <> 'canceled'",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE correlation_id = $1 \
             ORDER BY updated_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn list_subscriptions_by_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn list_subscriptions_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE status = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn upsert_subscription(&self, s: &Subscription) -> BillingResult<Subscription> {
        let updated: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                plan_id = $2,
                status = $3,
                current_period_start = $4,
                current_period_end = $5,
                cancel_at_period_end = $6,
                payment_method = $7,
                correlation_id = $8,
                customer_reference = $9,
                activated_at = COALESCE(activated_at, $10),
                canceled_at = $11,
                updated_at = $12
            WHERE id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(s.id)
        .bind(s.plan_id)
        .bind(s.status.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.cancel_at_period_end)
        .bind(s.payment_method.as_str())
        .bind(&s.correlation_id)
        .bind(&s.customer_reference)
        .bind(s.activated_at)
        .bind(s.canceled_at)
        .bind(s.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return row.try_into();
        }

        // New row, or a concurrent writer already opened one for this user:
        // the partial unique index turns the insert into an update of it.
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, plan_id, status, current_period_start, current_period_end,
                cancel_at_period_end, payment_method, correlation_id, customer_reference,
                activated_at, canceled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (user_id) WHERE status <> 'canceled' DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                payment_method = EXCLUDED.payment_method,
                correlation_id = EXCLUDED.correlation_id,
                customer_reference = COALESCE(EXCLUDED.customer_reference, subscriptions.customer_reference),
                activated_at = COALESCE(subscriptions.activated_at, EXCLUDED.activated_at),
                canceled_at = EXCLUDED.canceled_at,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(s.id)
        .bind(s.user_id)
        .bind(s.plan_id)
        .bind(s.status.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.cancel_at_period_end)
        .bind(s.payment_method.as_str())
        .bind(&s.correlation_id)
        .bind(&s.customer_reference)
        .bind(s.activated_at)
        .bind(s.canceled_at)
        .bind(s.created_at)
        .bind(s.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn activate_subscription(
        &self,
        s: &Subscription,
        correlation_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = 'active',
                activated_at = COALESCE(activated_at, $3),
                customer_reference = COALESCE($4, customer_reference),
                updated_at = $5
            WHERE id = $1 AND status = 'pending' AND correlation_id = $2
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(s.id)
        .bind(correlation_id)
        .bind(s.activated_at)
        .bind(&s.customer_reference)
        .bind(s.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn append_transaction(&self, t: &PaymentTransaction) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_transactions (
                id, user_id, subscription_id, amount_cents, currency, status,
                payment_method, provider_transaction_id, correlation_id, description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (provider_transaction_id) DO NOTHING
            "#,
        )
        .bind(t.id)
        .bind(t.user_id)
        .bind(t.subscription_id)
        .bind(t.amount_cents)
        .bind(&t.currency)
        .bind(t.status.as_str())
        .bind(t.payment_method.as_str())
        .bind(&t.provider_transaction_id)
        .bind(&t.correlation_id)
        .bind(&t.description)
        .bind(t.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::DuplicateTransaction(
                t.provider_transaction_id.clone(),
            ));
        }
        Ok(())
    }

    async fn get_transaction_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> BillingResult<Option<PaymentTransaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_transactions WHERE provider_transaction_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(provider_transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn get_transaction_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<PaymentTransaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_transactions WHERE correlation_id = $1 \
             ORDER BY created_at LIMIT 1",
            TRANSACTION_COLUMNS
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn list_transactions_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<PaymentTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_transactions WHERE user_id = $1 ORDER BY created_at DESC",
            TRANSACTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn referrer_of(&self, user_id: Uuid) -> BillingResult<Option<Uuid>> {
        let referrer: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT referred_by FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(referrer.flatten())
    }

    async fn list_referred_users(&self, referrer_id: Uuid) -> BillingResult<Vec<Uuid>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM users WHERE referred_by = $1")
                .bind(referrer_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn set_referrer(&self, referred_id: Uuid, referrer_id: Uuid) -> BillingResult<bool> {
        let result =
            sqlx::query("UPDATE users SET referred_by = $2 WHERE id = $1 AND referred_by IS NULL")
                .bind(referred_id)
                .bind(referrer_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_referral_code(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT code FROM referral_codes WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_referral_code(&self, user_id: Uuid, code: &str) -> BillingResult<bool> {
        // Either unique constraint (user or code) turns this into a no-op
        let result = sqlx::query(
            "INSERT INTO referral_codes (user_id, code) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_user_by_referral_code(&self, code: &str) -> BillingResult<Option<Uuid>> {
        Ok(
            sqlx::query_scalar("SELECT user_id FROM referral_codes WHERE code = $1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn has_bank_account(&self, user_id: Uuid) -> BillingResult<bool> {
        Ok(
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM bank_accounts WHERE user_id = $1)")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn upsert_commission(&self, c: &Commission) -> BillingResult<Commission> {
        let row: CommissionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO commissions (
                id, referrer_id, referred_id, subscription_id, monthly_amount_cents,
                status, start_date, end_date, last_paid_period, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                end_date = EXCLUDED.end_date,
                last_paid_period = EXCLUDED.last_paid_period
            RETURNING {}
            "#,
            COMMISSION_COLUMNS
        ))
        .bind(c.id)
        .bind(c.referrer_id)
        .bind(c.referred_id)
        .bind(c.subscription_id)
        .bind(c.monthly_amount_cents)
        .bind(c.status.as_str())
        .bind(c.start_date)
        .bind(c.end_date)
        .bind(c.last_paid_period.map(|p| p.to_string()))
        .bind(c.created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_commission_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Commission>> {
        let row: Option<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions WHERE subscription_id = $1",
            COMMISSION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Commission::try_from).transpose()
    }

    async fn list_commissions_by_referrer(
        &self,
        referrer_id: Uuid,
    ) -> BillingResult<Vec<Commission>> {
        let rows: Vec<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions WHERE referrer_id = $1 ORDER BY start_date",
            COMMISSION_COLUMNS
        ))
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn list_commissions_by_referred(
        &self,
        referred_id: Uuid,
    ) -> BillingResult<Vec<Commission>> {
        let rows: Vec<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions WHERE referred_id = $1 ORDER BY start_date",
            COMMISSION_COLUMNS
        ))
        .bind(referred_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn list_active_commissions(&self) -> BillingResult<Vec<Commission>> {
        let rows: Vec<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions WHERE status = 'active' ORDER BY referrer_id, start_date",
            COMMISSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn append_event(&self, e: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (id, user_id, subscription_id, event_type, actor_type, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(e.id)
        .bind(e.user_id)
        .bind(e.subscription_id)
        .bind(e.event_type.as_str())
        .bind(e.actor_type.as_str())
        .bind(&e.data)
        .bind(e.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Plan catalog backed by the `plans` table
#[derive(Clone)]
pub struct PgPlanCatalog {
    pool: PgPool,
}

impl PgPlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PLAN_COLUMNS: &str = "id, name, description, price_cents, currency, billing_interval, \
    features, client_limit, is_active, sort_order";

#[async_trait]
impl PlanCatalog for PgPlanCatalog {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans WHERE id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::try_from).transpose()
    }

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans WHERE is_active ORDER BY sort_order, name",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn create_plan(&self, plan: NewPlan) -> BillingResult<Plan> {
        plan.validate()?;
        let plan = plan.into_plan(Uuid::new_v4());

        sqlx::query(
            r#"
            INSERT INTO plans (id, name, description, price_cents, currency, billing_interval,
                               features, client_limit, is_active, sort_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.interval.as_str())
        .bind(Json(&plan.features))
        .bind(plan.client_limit)
        .bind(plan.is_active)
        .bind(plan.sort_order)
        .execute(&self.pool)
        .await?;

        tracing::info!(plan_id = %plan.id, name = %plan.name, "Plan created");
        Ok(plan)
    }

    async fn set_plan_active(&self, plan_id: Uuid, active: bool) -> BillingResult<()> {
        let result = sqlx::query("UPDATE plans SET is_active = $2 WHERE id = $1")
            .bind(plan_id)
            .bind(active)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::PlanNotFound(plan_id.to_string()));
        }
        Ok(())
    }
}
