//! Subscription lifecycle
//!
//! `pending -> active -> canceled`, with `canceled` also reachable straight
//! from `pending` (abandoned or expired checkout). A user has at most one
//! subscription that is not canceled; re-initiating checkout rewrites that
//! record instead of adding a second one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::commissions::CommissionService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::TransactionLedger;
use crate::locks::KeyedLocks;
use crate::plans::PlanCatalog;
use crate::providers::{Confirmation, PaymentMethod, ProviderRegistry};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriptionStatus::Pending),
            "active" => Ok(SubscriptionStatus::Active),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            other => Err(BillingError::Internal(format!(
                "Unknown subscription status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    /// Soft cancel: flips to `canceled` at the period-end sweep
    pub cancel_at_period_end: bool,
    pub payment_method: PaymentMethod,
    /// PayPal order id or Stripe Checkout Session id of the latest attempt
    pub correlation_id: Option<String>,
    pub customer_reference: Option<String>,
    /// First time this subscription became active
    pub activated_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn has_access(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    pub fn is_open(&self) -> bool {
        self.status != SubscriptionStatus::Canceled
    }
}

/// Where to send the user to pay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutRedirect {
    pub subscription_id: Uuid,
    pub redirect_url: String,
    pub correlation_id: String,
}

/// What applying a provider confirmation did
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationResult {
    /// `pending -> active`
    Activated(Subscription),
    /// Capture already applied earlier
    AlreadyRecorded(Subscription),
    /// Money moved for a subscription that was canceled or renewed meanwhile
    RecordedWithoutActivation(Subscription),
    /// Provider is still processing the payment; nothing changed
    StillPending(Subscription),
    /// Provider declined; the subscription stays `pending`
    Rejected {
        subscription: Subscription,
        reason: String,
    },
}

impl ConfirmationResult {
    pub fn subscription(&self) -> &Subscription {
        match self {
            ConfirmationResult::Activated(s)
            | ConfirmationResult::AlreadyRecorded(s)
            | ConfirmationResult::RecordedWithoutActivation(s)
            | ConfirmationResult::StillPending(s) => s,
            ConfirmationResult::Rejected { subscription, .. } => subscription,
        }
    }
}

pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    catalog: Arc<dyn PlanCatalog>,
    providers: ProviderRegistry,
    ledger: TransactionLedger,
    commissions: CommissionService,
    event_logger: BillingEventLogger,
    user_locks: KeyedLocks,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: Arc<dyn PlanCatalog>,
        providers: ProviderRegistry,
        commissions: CommissionService,
    ) -> Self {
        Self {
            ledger: TransactionLedger::new(store.clone()),
            event_logger: BillingEventLogger::new(store.clone()),
            store,
            catalog,
            providers,
            commissions,
            user_locks: KeyedLocks::new(),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    /// Start a checkout for `plan_id`, or restart it for a user who already
    /// has a subscription. The provider is called first; if it fails nothing
    /// local changes.
    pub async fn start_or_renew(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        method: PaymentMethod,
    ) -> BillingResult<CheckoutRedirect> {
        let plan = self.catalog.get_active_plan(plan_id).await?;
        let provider = self.providers.get(method)?;

        let _guard = self.user_locks.lock(user_id.to_string()).await;

        let initiated = provider.initiate(user_id, &plan).await.map_err(|e| {
            tracing::error!(
                user_id = %user_id,
                plan_id = %plan_id,
                method = %method,
                error = %e,
                "Payment initiation failed"
            );
            e
        })?;

        let now = OffsetDateTime::now_utc();
        let period_end = plan.interval.advance(now)?;

        let record = match self.store.get_subscription_by_user(user_id).await? {
            Some(mut existing) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %existing.id,
                    previous_status = %existing.status,
                    previous_correlation_id = ?existing.correlation_id,
                    "Renewing existing subscription in place"
                );
                existing.plan_id = plan.id;
                existing.status = SubscriptionStatus::Pending;
                existing.current_period_start = now;
                existing.current_period_end = period_end;
                existing.cancel_at_period_end = false;
                existing.payment_method = method;
                existing.correlation_id = Some(initiated.correlation_id.clone());
                existing.updated_at = now;
                existing
            }
            None => Subscription {
                id: Uuid::new_v4(),
                user_id,
                plan_id: plan.id,
                status: SubscriptionStatus::Pending,
                current_period_start: now,
                current_period_end: period_end,
                cancel_at_period_end: false,
                payment_method: method,
                correlation_id: Some(initiated.correlation_id.clone()),
                customer_reference: None,
                activated_at: None,
                canceled_at: None,
                created_at: now,
                updated_at: now,
            },
        };

        let stored = self.store.upsert_subscription(&record).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %stored.id,
            plan_id = %plan.id,
            method = %method,
            correlation_id = %initiated.correlation_id,
            "Checkout initiated"
        );
        self.event_logger
            .log_or_warn(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionInitiated)
                    .subscription(stored.id)
                    .actor_type(ActorType::User)
                    .data(serde_json::json!({
                        "plan_id": plan.id,
                        "method": method.as_str(),
                        "correlation_id": initiated.correlation_id,
                        "amount_cents": plan.price_cents,
                        "currency": plan.currency,
                    })),
            )
            .await;

        Ok(CheckoutRedirect {
            subscription_id: stored.id,
            redirect_url: initiated.redirect_url,
            correlation_id: initiated.correlation_id,
        })
    }

    pub async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        self.store.get_subscription_by_correlation_id(correlation_id).await
    }

    /// Apply a provider outcome to the subscription it belongs to.
    ///
    /// Callers serialize calls per correlation id; the user lock taken here
    /// orders them against renewals and cancellations. Capturing writes the
    /// ledger before the status changes, so a crash in between is repaired
    /// by the next delivery of the same confirmation.
    pub async fn confirm_payment(
        &self,
        correlation_id: &str,
        confirmation: &Confirmation,
    ) -> BillingResult<ConfirmationResult> {
        let user_id = self
            .store
            .get_subscription_by_correlation_id(correlation_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(correlation_id.to_string()))?
            .user_id;

        let _guard = self.user_locks.lock(user_id.to_string()).await;

        // Re-read under the lock; a renewal may have replaced the correlation id
        let mut subscription = self
            .store
            .get_subscription_by_correlation_id(correlation_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(correlation_id.to_string()))?;

        if confirmation.is_pending() {
            tracing::info!(
                user_id = %subscription.user_id,
                subscription_id = %subscription.id,
                correlation_id = %correlation_id,
                "Payment still processing at provider"
            );
            return Ok(ConfirmationResult::StillPending(subscription));
        }

        if !confirmation.is_captured() {
            let reason = confirmation
                .failure_reason
                .clone()
                .unwrap_or_else(|| "declined".to_string());

            tracing::warn!(
                user_id = %subscription.user_id,
                subscription_id = %subscription.id,
                correlation_id = %correlation_id,
                reason = %reason,
                "Payment rejected by provider"
            );
            self.event_logger
                .log_or_warn(
                    BillingEventBuilder::new(subscription.user_id, BillingEventType::PaymentRejected)
                        .subscription(subscription.id)
                        .actor_type(ActorType::Provider)
                        .data(serde_json::json!({
                            "correlation_id": correlation_id,
                            "method": subscription.payment_method.as_str(),
                            "reason": reason,
                        })),
                )
                .await;

            return Ok(ConfirmationResult::Rejected {
                subscription,
                reason,
            });
        }

        let description = match self.catalog.get_plan(subscription.plan_id).await? {
            Some(plan) => format!("{} ({})", plan.name, plan.interval),
            None => "Subscription payment".to_string(),
        };
        let newly_recorded = self
            .ledger
            .record_capture(&subscription, correlation_id, confirmation, &description)
            .await?;

        match subscription.status {
            SubscriptionStatus::Canceled => {
                return Ok(self
                    .recorded_without_activation(
                        subscription,
                        correlation_id,
                        confirmation,
                        newly_recorded,
                    )
                    .await);
            }
            SubscriptionStatus::Active => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    correlation_id = %correlation_id,
                    "Subscription already active, confirmation is a duplicate"
                );
                return Ok(ConfirmationResult::AlreadyRecorded(subscription));
            }
            SubscriptionStatus::Pending => {}
        }

        let now = OffsetDateTime::now_utc();
        subscription.status = SubscriptionStatus::Active;
        subscription.activated_at.get_or_insert(now);
        if confirmation.customer_reference.is_some() {
            subscription.customer_reference = confirmation.customer_reference.clone();
        }
        subscription.updated_at = now;

        // Only a row still pending under this correlation id may flip; another
        // process sharing the database can have canceled or renewed it.
        let Some(subscription) = self
            .store
            .activate_subscription(&subscription, correlation_id)
            .await?
        else {
            let current = self
                .store
                .get_subscription(subscription.id)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(subscription.id.to_string()))?;
            return Ok(self
                .recorded_without_activation(
                    current,
                    correlation_id,
                    confirmation,
                    newly_recorded,
                )
                .await);
        };

        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            correlation_id = %correlation_id,
            period_end = %subscription.current_period_end,
            "Subscription activated"
        );
        self.log_capture(&subscription, correlation_id, confirmation, true)
            .await;

        // Commissions are derived data; a failure here must not undo a payment
        if let Err(e) = self.commissions.on_subscription_activated(&subscription).await {
            tracing::error!(
                subscription_id = %subscription.id,
                error = %e,
                "Failed to accrue referral commissions"
            );
        }

        Ok(ConfirmationResult::Activated(subscription))
    }

    async fn recorded_without_activation(
        &self,
        subscription: Subscription,
        correlation_id: &str,
        confirmation: &Confirmation,
        newly_recorded: bool,
    ) -> ConfirmationResult {
        tracing::warn!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            correlation_id = %correlation_id,
            "Capture recorded without activating the subscription"
        );
        if newly_recorded {
            self.log_capture(&subscription, correlation_id, confirmation, false)
                .await;
        }
        ConfirmationResult::RecordedWithoutActivation(subscription)
    }

    async fn log_capture(
        &self,
        subscription: &Subscription,
        correlation_id: &str,
        confirmation: &Confirmation,
        activated: bool,
    ) {
        self.event_logger
            .log_or_warn(
                BillingEventBuilder::new(subscription.user_id, BillingEventType::PaymentCaptured)
                    .subscription(subscription.id)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({
                        "correlation_id": correlation_id,
                        "provider_transaction_id": confirmation.provider_transaction_id,
                        "amount_cents": confirmation.amount_cents,
                        "currency": confirmation.currency,
                        "activated": activated,
                    })),
            )
            .await;
    }

    /// Cancel the user's subscription, now or at the end of the paid period.
    ///
    /// A pending subscription has no paid period and is always canceled
    /// immediately. Repeating a cancel returns the same state.
    pub async fn cancel(&self, user_id: Uuid, immediate: bool) -> BillingResult<Subscription> {
        let _guard = self.user_locks.lock(user_id.to_string()).await;

        let Some(mut subscription) = self.store.get_subscription_by_user(user_id).await? else {
            let latest = self
                .store
                .list_subscriptions_by_user(user_id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

            // Already canceled; make sure its commission did not outlive it
            let at = latest.canceled_at.unwrap_or(latest.updated_at);
            self.commissions.on_subscription_canceled(&latest, at).await?;
            return Ok(latest);
        };

        if immediate || subscription.status == SubscriptionStatus::Pending {
            return self
                .cancel_now(
                    subscription,
                    OffsetDateTime::now_utc(),
                    BillingEventType::SubscriptionCanceled,
                )
                .await;
        }

        if subscription.cancel_at_period_end {
            return Ok(subscription);
        }

        subscription.cancel_at_period_end = true;
        subscription.updated_at = OffsetDateTime::now_utc();
        let subscription = self.store.upsert_subscription(&subscription).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            period_end = %subscription.current_period_end,
            "Cancellation scheduled for period end"
        );
        self.event_logger
            .log_or_warn(
                BillingEventBuilder::new(user_id, BillingEventType::CancellationScheduled)
                    .subscription(subscription.id)
                    .actor_type(ActorType::User)
                    .data(serde_json::json!({
                        "period_end": subscription.current_period_end,
                    })),
            )
            .await;

        Ok(subscription)
    }

    async fn cancel_now(
        &self,
        mut subscription: Subscription,
        at: OffsetDateTime,
        event_type: BillingEventType,
    ) -> BillingResult<Subscription> {
        let previous_status = subscription.status;
        subscription.status = SubscriptionStatus::Canceled;
        subscription.canceled_at = Some(at);
        subscription.updated_at = at;
        let subscription = self.store.upsert_subscription(&subscription).await?;

        self.commissions.on_subscription_canceled(&subscription, at).await?;

        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            previous_status = %previous_status,
            reason = %event_type,
            "Subscription canceled"
        );
        self.event_logger
            .log_or_warn(
                BillingEventBuilder::new(subscription.user_id, event_type)
                    .subscription(subscription.id)
                    .data(serde_json::json!({
                        "previous_status": previous_status.as_str(),
                        "correlation_id": subscription.correlation_id,
                    })),
            )
            .await;

        Ok(subscription)
    }

    /// Cancel every soft-canceled subscription whose period has ended
    pub async fn apply_period_end_cancellations(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let due: Vec<Subscription> = self
            .store
            .list_subscriptions_by_status(SubscriptionStatus::Active)
            .await?
            .into_iter()
            .filter(|s| s.cancel_at_period_end && s.current_period_end <= now)
            .collect();

        let mut canceled = Vec::with_capacity(due.len());
        for candidate in due {
            let _guard = self.user_locks.lock(candidate.user_id.to_string()).await;

            // Re-read under the lock; the user may have renewed meanwhile
            let Some(current) = self.store.get_subscription(candidate.id).await? else {
                continue;
            };
            if current.status != SubscriptionStatus::Active
                || !current.cancel_at_period_end
                || current.current_period_end > now
            {
                continue;
            }

            let at = current.current_period_end;
            match self
                .cancel_now(current, at, BillingEventType::SubscriptionCanceled)
                .await
            {
                Ok(sub) => canceled.push(sub),
                Err(e) => tracing::error!(
                    subscription_id = %candidate.id,
                    error = %e,
                    "Failed to apply period-end cancellation"
                ),
            }
        }

        Ok(canceled)
    }

    /// Cancel checkouts that stayed `pending` longer than `ttl`
    pub async fn expire_stale_pending(
        &self,
        now: OffsetDateTime,
        ttl: time::Duration,
    ) -> BillingResult<Vec<Subscription>> {
        let cutoff = now - ttl;
        let stale: Vec<Subscription> = self
            .store
            .list_subscriptions_by_status(SubscriptionStatus::Pending)
            .await?
            .into_iter()
            .filter(|s| s.updated_at <= cutoff)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for candidate in stale {
            let _guard = self.user_locks.lock(candidate.user_id.to_string()).await;

            let Some(current) = self.store.get_subscription(candidate.id).await? else {
                continue;
            };
            if current.status != SubscriptionStatus::Pending || current.updated_at > cutoff {
                continue;
            }

            match self
                .cancel_now(current, now, BillingEventType::CheckoutExpired)
                .await
            {
                Ok(sub) => expired.push(sub),
                Err(e) => tracing::error!(
                    subscription_id = %candidate.id,
                    error = %e,
                    "Failed to expire pending checkout"
                ),
            }
        }

        Ok(expired)
    }

    /// The user's open subscription, else their most recent canceled one
    pub async fn get_status(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        if let Some(open) = self.store.get_subscription_by_user(user_id).await? {
            return Ok(Some(open));
        }
        Ok(self
            .store
            .list_subscriptions_by_user(user_id)
            .await?
            .into_iter()
            .next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommissionConfig;
    use crate::plans::{BillingInterval, InMemoryPlanCatalog, NewPlan};
    use crate::providers::mock::MockProvider;
    use crate::store::InMemoryBillingStore;

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        provider: Arc<MockProvider>,
        service: SubscriptionService,
        plan_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let catalog = Arc::new(InMemoryPlanCatalog::new());
        let plan = catalog
            .create_plan(NewPlan {
                name: "Professional".to_string(),
                description: None,
                price_cents: 2000,
                currency: None,
                interval: BillingInterval::Month,
                features: vec![],
                client_limit: None,
                sort_order: 0,
            })
            .await
            .unwrap();

        let provider = Arc::new(MockProvider::new(PaymentMethod::PayPal));
        let providers = ProviderRegistry::new().with(provider.clone());
        let commissions = CommissionService::new(store.clone(), CommissionConfig::default());
        let service = SubscriptionService::new(store.clone(), catalog, providers, commissions);

        Fixture {
            store,
            provider,
            service,
            plan_id: plan.id,
        }
    }

    #[tokio::test]
    async fn test_start_creates_pending_with_monthly_window() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.provider.queue_correlation_id("ref-1");

        let redirect = f
            .service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();
        assert_eq!(redirect.correlation_id, "ref-1");

        let sub = f.service.get_status(user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert_eq!(sub.correlation_id.as_deref(), Some("ref-1"));
        assert_eq!(
            sub.current_period_end,
            crate::plans::add_months(sub.current_period_start, 1).unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_plan_and_unconfigured_provider() {
        let f = fixture().await;
        let user = Uuid::new_v4();

        assert!(matches!(
            f.service
                .start_or_renew(user, Uuid::new_v4(), PaymentMethod::PayPal)
                .await,
            Err(BillingError::PlanNotFound(_))
        ));
        assert!(matches!(
            f.service
                .start_or_renew(user, f.plan_id, PaymentMethod::Stripe)
                .await,
            Err(BillingError::ProviderUnavailable(_))
        ));
        assert_eq!(f.provider.initiate_calls(), 0);
        assert!(f.service.get_status(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_no_state() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.provider.fail_initiate(true);

        assert!(matches!(
            f.service
                .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
                .await,
            Err(BillingError::ProviderUnavailable(_))
        ));
        assert!(f.service.get_status(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_rewrites_same_record() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.provider.queue_correlation_id("ref-1");
        f.provider.queue_correlation_id("ref-2");

        let first = f
            .service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();
        let second = f
            .service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();

        assert_eq!(first.subscription_id, second.subscription_id);
        let all = f.store.list_subscriptions_by_user(user).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].correlation_id.as_deref(), Some("ref-2"));
        assert!(f
            .service
            .find_by_correlation("ref-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_capture_activates_once() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.provider.queue_correlation_id("ref-1");
        f.service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();

        let confirmation = Confirmation::captured("txn-9", 2000, "EUR")
            .with_customer(Some("PAYER-7".to_string()));
        let first = f.service.confirm_payment("ref-1", &confirmation).await.unwrap();
        let second = f.service.confirm_payment("ref-1", &confirmation).await.unwrap();

        assert!(matches!(first, ConfirmationResult::Activated(_)));
        assert!(matches!(second, ConfirmationResult::AlreadyRecorded(_)));
        let sub = first.subscription();
        assert!(sub.has_access());
        assert!(sub.activated_at.is_some());
        assert_eq!(sub.customer_reference.as_deref(), Some("PAYER-7"));
        assert_eq!(f.service.ledger().list_for_user(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_keeps_pending_and_logs_event() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.provider.queue_correlation_id("ref-1");
        f.service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();

        let result = f
            .service
            .confirm_payment("ref-1", &Confirmation::rejected("INSTRUMENT_DECLINED"))
            .await
            .unwrap();

        assert!(matches!(result, ConfirmationResult::Rejected { ref reason, .. } if reason == "INSTRUMENT_DECLINED"));
        assert_eq!(
            f.service.get_status(user).await.unwrap().unwrap().status,
            SubscriptionStatus::Pending
        );
        assert!(f.service.ledger().list_for_user(user).await.unwrap().is_empty());
        assert!(f
            .store
            .events()
            .iter()
            .any(|e| e.event_type == BillingEventType::PaymentRejected));
    }

    #[tokio::test]
    async fn test_processing_payment_changes_nothing() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.provider.queue_correlation_id("ref-1");
        f.service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();
        let before = f.service.get_status(user).await.unwrap().unwrap();
        let events_before = f.store.events().len();

        let result = f
            .service
            .confirm_payment("ref-1", &Confirmation::pending())
            .await
            .unwrap();

        assert_eq!(result, ConfirmationResult::StillPending(before.clone()));
        assert_eq!(f.service.get_status(user).await.unwrap().unwrap(), before);
        assert_eq!(f.store.events().len(), events_before);
        assert!(f.service.ledger().list_for_user(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_not_found() {
        let f = fixture().await;
        assert!(matches!(
            f.service
                .confirm_payment("ref-404", &Confirmation::captured("txn-1", 2000, "EUR"))
                .await,
            Err(BillingError::SubscriptionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_cancel_then_period_end_sweep() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.provider.queue_correlation_id("ref-1");
        f.service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();
        f.service
            .confirm_payment("ref-1", &Confirmation::captured("txn-1", 2000, "EUR"))
            .await
            .unwrap();

        let flagged = f.service.cancel(user, false).await.unwrap();
        assert_eq!(flagged.status, SubscriptionStatus::Active);
        assert!(flagged.cancel_at_period_end);
        assert_eq!(f.service.cancel(user, false).await.unwrap(), flagged);

        let before_end = flagged.current_period_end - time::Duration::seconds(1);
        assert!(f
            .service
            .apply_period_end_cancellations(before_end)
            .await
            .unwrap()
            .is_empty());

        let swept = f
            .service
            .apply_period_end_cancellations(flagged.current_period_end)
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, SubscriptionStatus::Canceled);
        assert_eq!(swept[0].canceled_at, Some(flagged.current_period_end));
    }

    #[tokio::test]
    async fn test_deferred_cancel_of_pending_cancels_now() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();

        let canceled = f.service.cancel(user, false).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(canceled.canceled_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_without_subscription() {
        let f = fixture().await;
        assert!(matches!(
            f.service.cancel(Uuid::new_v4(), true).await,
            Err(BillingError::SubscriptionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_stale_pending() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        f.provider.queue_correlation_id("ref-1");
        f.service
            .start_or_renew(user, f.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();
        let ttl = time::Duration::days(7);
        let now = OffsetDateTime::now_utc();

        assert!(f.service.expire_stale_pending(now, ttl).await.unwrap().is_empty());

        let expired = f
            .service
            .expire_stale_pending(now + time::Duration::days(8), ttl)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, SubscriptionStatus::Canceled);

        // Late capture is recorded but does not reactivate
        let late = f
            .service
            .confirm_payment("ref-1", &Confirmation::captured("txn-late", 2000, "EUR"))
            .await
            .unwrap();
        assert!(matches!(late, ConfirmationResult::RecordedWithoutActivation(_)));
        assert_eq!(f.service.ledger().list_for_user(user).await.unwrap().len(), 1);
        assert_eq!(
            f.service.get_status(user).await.unwrap().unwrap().status,
            SubscriptionStatus::Canceled
        );
    }
}
