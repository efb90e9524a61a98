// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Praxis Billing Engine
//!
//! Subscription lifecycle and referral commission settlement on top of
//! PayPal and Stripe Checkout.
//!
//! ## Features
//!
//! - **Subscriptions**: `pending -> active -> canceled`, at most one open
//!   subscription per user, immediate or period-end cancellation
//! - **Providers**: PayPal Orders (capture on return) and Stripe Checkout
//!   behind one `PaymentProvider` trait
//! - **Reconciliation**: webhooks and browser returns applied exactly once
//! - **Ledger**: append-only record of captured payments
//! - **Commissions**: fixed monthly referral commissions once a referrer
//!   reaches the qualifying threshold; referrals are registered by code
//! - **Invariants**: runnable consistency checks over the schema

pub mod commissions;
pub mod config;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod locks;
pub mod plans;
pub mod providers;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Commissions
pub use commissions::{
    BankAccount, BillingPeriod, Commission, CommissionService, CommissionStatus, ReferralStats,
};

// Config
pub use config::{BillingConfig, CommissionConfig, PayPalConfig, PayPalMode, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{PaymentTransaction, TransactionLedger, TransactionStatus};

// Plans
pub use plans::{BillingInterval, InMemoryPlanCatalog, NewPlan, Plan, PlanCatalog};

// Providers
pub use providers::{
    Confirmation, PayPalProvider, PaymentMethod, PaymentProvider, ProviderRegistry,
    StripeProvider, WebhookEvent,
};

// Store
pub use store::{run_migrations, BillingStore, InMemoryBillingStore, PgBillingStore, PgPlanCatalog};

// Subscriptions
pub use subscriptions::{
    CheckoutRedirect, ConfirmationResult, Subscription, SubscriptionService, SubscriptionStatus,
};

// Webhooks
pub use webhooks::{DeliveryOutcome, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::providers::paypal::PayPalSignatureHeaders;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: BillingConfig,
    pub catalog: Arc<dyn PlanCatalog>,
    pub subscriptions: Arc<SubscriptionService>,
    pub commissions: CommissionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
        let catalog: Arc<dyn PlanCatalog> = Arc::new(PgPlanCatalog::new(pool));
        Self::new(config, store, catalog)
    }

    /// Create a new billing service with explicit config. Only providers
    /// with a config section are registered.
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        catalog: Arc<dyn PlanCatalog>,
    ) -> BillingResult<Self> {
        let mut providers = ProviderRegistry::new();

        let stripe = config
            .stripe
            .clone()
            .map(|c| Arc::new(StripeProvider::new(c)));
        if let Some(stripe) = &stripe {
            providers.register(stripe.clone());
            tracing::info!(live = stripe.config().is_live(), "Stripe provider registered");
        }

        let paypal = match config.paypal.clone() {
            Some(c) => Some(Arc::new(PayPalProvider::new(c)?)),
            None => None,
        };
        if let Some(paypal) = &paypal {
            providers.register(paypal.clone());
            tracing::info!("PayPal provider registered");
        }

        let mut service = Self::with_providers(config, store, catalog, providers);
        if let Some(stripe) = stripe {
            service.webhooks = service.webhooks.with_stripe(stripe);
        }
        if let Some(paypal) = paypal {
            service.webhooks = service.webhooks.with_paypal(paypal);
        }
        Ok(service)
    }

    /// Build around an explicit provider registry. Webhook signature checks
    /// stay disabled; authenticated events go through `webhooks.handle_event`.
    pub fn with_providers(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        catalog: Arc<dyn PlanCatalog>,
        providers: ProviderRegistry,
    ) -> Self {
        let commissions = CommissionService::new(store.clone(), config.commission);
        let subscriptions = Arc::new(SubscriptionService::new(
            store,
            catalog.clone(),
            providers,
            commissions.clone(),
        ));
        let webhooks = WebhookHandler::new(subscriptions.clone());

        Self {
            config,
            catalog,
            subscriptions,
            commissions,
            webhooks,
        }
    }

    /// Start (or restart) checkout; returns where to send the user
    pub async fn initiate_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        method: PaymentMethod,
    ) -> BillingResult<CheckoutRedirect> {
        self.subscriptions
            .start_or_renew(user_id, plan_id, method)
            .await
    }

    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        immediate: bool,
    ) -> BillingResult<Subscription> {
        self.subscriptions.cancel(user_id, immediate).await
    }

    pub async fn get_subscription_status(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.subscriptions.get_status(user_id).await
    }

    /// Newest first
    pub async fn list_user_transactions(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<PaymentTransaction>> {
        self.subscriptions.ledger().list_for_user(user_id).await
    }

    pub async fn get_referral_stats(&self, referrer_id: Uuid) -> BillingResult<ReferralStats> {
        self.commissions
            .referral_stats(referrer_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        self.catalog.list_active_plans().await
    }

    pub async fn handle_stripe_webhook(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<DeliveryOutcome> {
        self.webhooks.handle_stripe_webhook(payload, signature).await
    }

    pub async fn handle_paypal_webhook(
        &self,
        headers: &PayPalSignatureHeaders,
        payload: &str,
    ) -> BillingResult<DeliveryOutcome> {
        self.webhooks.handle_paypal_webhook(headers, payload).await
    }

    pub async fn handle_browser_return(
        &self,
        method: PaymentMethod,
        correlation_id: &str,
        user_id: Uuid,
    ) -> BillingResult<Subscription> {
        self.webhooks
            .handle_browser_return(method, correlation_id, user_id)
            .await
    }

    /// The user's shareable referral code, created on first request
    pub async fn get_referral_code(&self, user_id: Uuid) -> BillingResult<String> {
        self.commissions.referral_code(user_id).await
    }

    /// A new user signed up with someone's referral code
    pub async fn register_referral(&self, user_id: Uuid, code: &str) -> BillingResult<Uuid> {
        self.commissions.register_referral(user_id, code).await
    }

    /// The referral link between `referred_id` and its referrer was removed
    pub async fn end_referral(&self, referred_id: Uuid) -> BillingResult<Vec<Commission>> {
        self.commissions
            .end_for_referred_user(referred_id, OffsetDateTime::now_utc())
            .await
    }

    /// Cancel checkouts older than the configured TTL
    pub async fn expire_stale_pending(&self) -> BillingResult<Vec<Subscription>> {
        self.subscriptions
            .expire_stale_pending(OffsetDateTime::now_utc(), self.config.pending_checkout_ttl)
            .await
    }

    pub async fn apply_period_end_cancellations(&self) -> BillingResult<Vec<Subscription>> {
        self.subscriptions
            .apply_period_end_cancellations(OffsetDateTime::now_utc())
            .await
    }

    /// Commissions due for `period`, input to the payout run
    pub async fn commission_report(&self, period: BillingPeriod) -> BillingResult<Vec<Commission>> {
        self.commissions.active_unpaid_for_period(period).await
    }
}
