//! Persistence contract for the billing engine
//!
//! The engine needs read-by-id, upsert and append only. Users, referral
//! links and bank accounts belong to other parts of the product; the store
//! exposes the few reads the engine makes against them.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::commissions::Commission;
use crate::error::BillingResult;
use crate::events::BillingEvent;
use crate::ledger::PaymentTransaction;
use crate::subscriptions::{Subscription, SubscriptionStatus};

pub use memory::InMemoryBillingStore;
pub use postgres::{run_migrations, PgBillingStore, PgPlanCatalog};

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscriptions

    /// The user's non-canceled subscription, if any
    async fn get_subscription_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn get_subscription_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Newest first
    async fn list_subscriptions_by_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>>;

    async fn list_subscriptions_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> BillingResult<Vec<Subscription>>;

    /// Insert or update a subscription.
    ///
    /// A non-canceled record for a user that already has a different
    /// non-canceled subscription is written onto that existing row (keeping
    /// its id, `created_at` and `activated_at`), so at most one open
    /// subscription per user exists regardless of caller interleaving. The
    /// stored record is returned.
    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription>;

    /// Write the `active` state of `subscription` only if the stored row is
    /// still `pending` under `correlation_id`. Returns `None` when the row
    /// has moved on (canceled, renewed or already active).
    async fn activate_subscription(
        &self,
        subscription: &Subscription,
        correlation_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    // Ledger

    /// Fails with `DuplicateTransaction` if the provider transaction id is
    /// already recorded
    async fn append_transaction(&self, transaction: &PaymentTransaction) -> BillingResult<()>;

    async fn get_transaction_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> BillingResult<Option<PaymentTransaction>>;

    async fn get_transaction_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<PaymentTransaction>>;

    /// Newest first
    async fn list_transactions_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<PaymentTransaction>>;

    // Referrals

    async fn referrer_of(&self, user_id: Uuid) -> BillingResult<Option<Uuid>>;

    async fn list_referred_users(&self, referrer_id: Uuid) -> BillingResult<Vec<Uuid>>;

    /// Link `referred_id` to `referrer_id` unless it already has a
    /// referrer. Returns whether the link was written.
    async fn set_referrer(&self, referred_id: Uuid, referrer_id: Uuid) -> BillingResult<bool>;

    async fn get_referral_code(&self, user_id: Uuid) -> BillingResult<Option<String>>;

    /// Returns `false` without writing when the user already has a code or
    /// `code` belongs to someone else
    async fn insert_referral_code(&self, user_id: Uuid, code: &str) -> BillingResult<bool>;

    async fn find_user_by_referral_code(&self, code: &str) -> BillingResult<Option<Uuid>>;

    async fn has_bank_account(&self, user_id: Uuid) -> BillingResult<bool>;

    // Commissions

    async fn upsert_commission(&self, commission: &Commission) -> BillingResult<Commission>;

    async fn get_commission_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Commission>>;

    async fn list_commissions_by_referrer(&self, referrer_id: Uuid)
        -> BillingResult<Vec<Commission>>;

    async fn list_commissions_by_referred(&self, referred_id: Uuid)
        -> BillingResult<Vec<Commission>>;

    async fn list_active_commissions(&self) -> BillingResult<Vec<Commission>>;

    // Audit trail

    async fn append_event(&self, event: &BillingEvent) -> BillingResult<()>;
}
