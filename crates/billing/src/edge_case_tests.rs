// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Cross-component properties that only hold when the state machine, the
//! reconciler, the ledger and the commission engine work together:
//! - Subscription lifecycle (at most one open subscription, cancellation)
//! - Reconciliation (duplicate, concurrent and stale deliveries)
//! - Commission accrual (threshold gating, cancellation)

#[cfg(test)]
mod harness {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::error::BillingResult;
    use crate::plans::{BillingInterval, InMemoryPlanCatalog, NewPlan, Plan, PlanCatalog};
    use crate::providers::mock::MockProvider;
    use crate::providers::{Confirmation, PaymentMethod, ProviderRegistry};
    use crate::store::InMemoryBillingStore;
    use crate::subscriptions::Subscription;
    use crate::{BillingConfig, BillingService};

    pub struct Harness {
        pub store: Arc<InMemoryBillingStore>,
        pub provider: Arc<MockProvider>,
        pub service: Arc<BillingService>,
        pub plan_id: Uuid,
    }

    /// Plan lookups that take `delay`, widening the window between reading
    /// a subscription and writing it back
    pub struct SlowCatalog {
        inner: InMemoryPlanCatalog,
        delay: Duration,
    }

    #[async_trait]
    impl PlanCatalog for SlowCatalog {
        async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_plan(plan_id).await
        }

        async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
            self.inner.list_active_plans().await
        }

        async fn create_plan(&self, plan: NewPlan) -> BillingResult<Plan> {
            self.inner.create_plan(plan).await
        }

        async fn set_plan_active(&self, plan_id: Uuid, active: bool) -> BillingResult<()> {
            self.inner.set_plan_active(plan_id, active).await
        }
    }

    pub async fn harness() -> Harness {
        build(Duration::ZERO, Duration::ZERO).await
    }

    pub async fn harness_with_delay(confirm_delay: Duration) -> Harness {
        build(confirm_delay, Duration::ZERO).await
    }

    pub async fn harness_with_slow_catalog(plan_delay: Duration) -> Harness {
        build(Duration::ZERO, plan_delay).await
    }

    async fn build(confirm_delay: Duration, plan_delay: Duration) -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let catalog = Arc::new(SlowCatalog {
            inner: InMemoryPlanCatalog::new(),
            delay: plan_delay,
        });
        let plan = catalog
            .create_plan(NewPlan {
                name: "Professional".to_string(),
                description: Some("Monthly professional plan".to_string()),
                price_cents: 2000,
                currency: Some("eur".to_string()),
                interval: BillingInterval::Month,
                features: vec!["reminders".to_string()],
                client_limit: None,
                sort_order: 1,
            })
            .await
            .unwrap();

        let provider =
            Arc::new(MockProvider::new(PaymentMethod::PayPal).with_confirm_delay(confirm_delay));
        let service = BillingService::with_providers(
            BillingConfig::default(),
            store.clone(),
            catalog,
            ProviderRegistry::new().with(provider.clone()),
        );

        Harness {
            store,
            provider,
            service: Arc::new(service),
            plan_id: plan.id,
        }
    }

    impl Harness {
        /// Checkout with `correlation_id` and script the provider to capture
        /// it as `transaction_id`, without delivering anything yet
        pub async fn checkout(&self, user_id: Uuid, correlation_id: &str, transaction_id: &str) {
            self.provider.queue_correlation_id(correlation_id);
            self.service
                .initiate_subscription(user_id, self.plan_id, PaymentMethod::PayPal)
                .await
                .unwrap();
            self.provider.set_confirmation(
                correlation_id,
                Confirmation::captured(transaction_id, 2000, "EUR"),
            );
        }

        /// Checkout and complete it through the browser return
        pub async fn activate(
            &self,
            user_id: Uuid,
            correlation_id: &str,
            transaction_id: &str,
        ) -> Subscription {
            self.checkout(user_id, correlation_id, transaction_id).await;
            self.service
                .handle_browser_return(PaymentMethod::PayPal, correlation_id, user_id)
                .await
                .unwrap()
        }
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::harness::*;
    use crate::error::BillingError;
    use crate::events::BillingEventType;
    use crate::providers::{Confirmation, PaymentMethod};
    use crate::subscriptions::SubscriptionStatus;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    // =========================================================================
    // Concurrent checkouts for one user leave exactly one open subscription
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_start_or_renew_keeps_one_open() {
        let h = harness().await;
        let user = Uuid::new_v4();

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let service = Arc::clone(&h.service);
            let barrier = Arc::clone(&barrier);
            let plan_id = h.plan_id;

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .initiate_subscription(user, plan_id, PaymentMethod::PayPal)
                    .await
            }));
        }

        let mut subscription_ids = vec![];
        for handle in handles {
            subscription_ids.push(handle.await.unwrap().unwrap().subscription_id);
        }

        let open: Vec<_> = h
            .store
            .subscriptions()
            .into_iter()
            .filter(|s| s.user_id == user && s.is_open())
            .collect();
        assert_eq!(open.len(), 1, "Exactly one open subscription expected");
        assert!(subscription_ids.iter().all(|id| *id == open[0].id));
        assert_eq!(h.provider.initiate_calls(), 10);
    }

    // =========================================================================
    // ref-1 / txn-9: confirmation delivered twice, one ledger entry
    // =========================================================================
    #[tokio::test]
    async fn test_double_delivery_single_ledger_entry() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.checkout(user, "ref-1", "txn-9").await;

        for _ in 0..2 {
            h.service
                .handle_browser_return(PaymentMethod::PayPal, "ref-1", user)
                .await
                .unwrap();
        }

        let transactions = h.service.list_user_transactions(user).await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].provider_transaction_id, "txn-9");
        assert_eq!(transactions[0].amount_cents, 2000);

        let sub = h.service.get_subscription_status(user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(
            sub.current_period_end,
            crate::plans::add_months(sub.current_period_start, 1).unwrap()
        );
        assert_eq!(h.provider.confirm_calls(), 1);
    }

    // =========================================================================
    // A rejected payment keeps the subscription pending and retryable
    // =========================================================================
    #[tokio::test]
    async fn test_rejected_payment_leaves_retry_path_open() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.provider.queue_correlation_id("ref-1");
        h.service
            .initiate_subscription(user, h.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();
        h.provider
            .set_confirmation("ref-1", Confirmation::rejected("INSTRUMENT_DECLINED"));

        let err = h
            .service
            .handle_browser_return(PaymentMethod::PayPal, "ref-1", user)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ConfirmationRejected(_)));

        let sub = h.service.get_subscription_status(user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert!(h.store.transactions().is_empty());
        assert!(h
            .store
            .events()
            .iter()
            .any(|e| e.event_type == BillingEventType::PaymentRejected));

        // Retry with a fresh checkout on the same record
        let retried = h.activate(user, "ref-2", "txn-2").await;
        assert_eq!(retried.id, sub.id);
        assert_eq!(retried.status, SubscriptionStatus::Active);
        assert_eq!(h.store.subscriptions().len(), 1);
    }

    // =========================================================================
    // Immediate cancel twice equals cancel once
    // =========================================================================
    #[tokio::test]
    async fn test_immediate_cancel_is_idempotent() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.activate(user, "ref-1", "txn-1").await;

        let first = h.service.cancel_subscription(user, true).await.unwrap();
        let second = h.service.cancel_subscription(user, true).await.unwrap();

        assert_eq!(first.status, SubscriptionStatus::Canceled);
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, second.status);
        assert_eq!(first.canceled_at, second.canceled_at);
        assert!(!second.has_access());
    }

    // =========================================================================
    // Deferred cancel twice equals once; access lasts until the sweep
    // =========================================================================
    #[tokio::test]
    async fn test_deferred_cancel_is_idempotent() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let active = h.activate(user, "ref-1", "txn-1").await;

        let first = h.service.cancel_subscription(user, false).await.unwrap();
        let second = h.service.cancel_subscription(user, false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.status, SubscriptionStatus::Active);
        assert!(second.cancel_at_period_end);
        assert!(second.has_access());

        // Nothing due yet
        assert!(h
            .service
            .apply_period_end_cancellations()
            .await
            .unwrap()
            .is_empty());

        let after_period = active.current_period_end + time::Duration::minutes(1);
        let swept = h
            .service
            .subscriptions
            .apply_period_end_cancellations(after_period)
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, SubscriptionStatus::Canceled);
        assert_eq!(swept[0].canceled_at, Some(active.current_period_end));
    }

    // =========================================================================
    // Cancel with nothing to cancel
    // =========================================================================
    // =========================================================================
    // A cancel landing while a capture is being applied stays canceled
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_during_confirmation_stays_canceled() {
        let h = harness_with_slow_catalog(Duration::from_millis(100)).await;
        let user = Uuid::new_v4();
        h.checkout(user, "ref-1", "txn-9").await;

        let subscriptions = Arc::clone(&h.service.subscriptions);
        let confirming = tokio::spawn(async move {
            subscriptions
                .confirm_payment("ref-1", &Confirmation::captured("txn-9", 2000, "EUR"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let canceled = h.service.cancel_subscription(user, true).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        confirming.await.unwrap().unwrap();

        let current = h.service.get_subscription_status(user).await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::Canceled);
        assert!(current.canceled_at.is_some());
        assert_eq!(h.store.transactions().len(), 1);
    }

    // =========================================================================
    // A renewal landing while a capture is being applied keeps its new
    // correlation id, and that checkout can still be paid
    // =========================================================================
    #[tokio::test]
    async fn test_renewal_during_confirmation_keeps_new_correlation() {
        let h = harness_with_slow_catalog(Duration::from_millis(100)).await;
        let user = Uuid::new_v4();
        h.checkout(user, "ref-1", "txn-9").await;

        let subscriptions = Arc::clone(&h.service.subscriptions);
        let confirming = tokio::spawn(async move {
            subscriptions
                .confirm_payment("ref-1", &Confirmation::captured("txn-9", 2000, "EUR"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.provider.queue_correlation_id("ref-2");
        let redirect = h
            .service
            .initiate_subscription(user, h.plan_id, PaymentMethod::PayPal)
            .await
            .unwrap();
        assert_eq!(redirect.correlation_id, "ref-2");
        confirming.await.unwrap().unwrap();

        let current = h.service.get_subscription_status(user).await.unwrap().unwrap();
        assert_eq!(current.correlation_id.as_deref(), Some("ref-2"));
        assert!(h
            .service
            .subscriptions
            .find_by_correlation("ref-2")
            .await
            .unwrap()
            .is_some());

        h.provider
            .set_confirmation("ref-2", Confirmation::captured("txn-10", 2000, "EUR"));
        let paid = h
            .service
            .handle_browser_return(PaymentMethod::PayPal, "ref-2", user)
            .await
            .unwrap();
        assert_eq!(paid.status, SubscriptionStatus::Active);
        assert_eq!(paid.correlation_id.as_deref(), Some("ref-2"));
    }

    #[tokio::test]
    async fn test_cancel_without_subscription() {
        let h = harness().await;
        assert!(matches!(
            h.service.cancel_subscription(Uuid::new_v4(), true).await,
            Err(BillingError::SubscriptionNotFound(_))
        ));
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use super::harness::*;
    use crate::providers::{PaymentMethod, WebhookEvent};
    use crate::subscriptions::{ConfirmationResult, SubscriptionStatus};
    use crate::webhooks::DeliveryOutcome;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    fn approval(correlation_id: &str) -> WebhookEvent {
        WebhookEvent {
            provider: PaymentMethod::PayPal,
            event_id: Some(format!("WH-{}", correlation_id)),
            event_type: "payment.confirmed".to_string(),
            provider_object: json!({ "correlation_id": correlation_id }),
        }
    }

    fn capture(correlation_id: &str, transaction_id: &str) -> WebhookEvent {
        WebhookEvent {
            provider: PaymentMethod::PayPal,
            event_id: Some(format!("WH-{}", transaction_id)),
            event_type: "payment.confirmed".to_string(),
            provider_object: json!({
                "correlation_id": correlation_id,
                "transaction_id": transaction_id,
                "amount_cents": 2000,
            }),
        }
    }

    // =========================================================================
    // Webhooks and browser returns racing: one capture, one ledger entry
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_deliveries_capture_once() {
        let h = harness_with_delay(Duration::from_millis(50)).await;
        let user = Uuid::new_v4();
        h.checkout(user, "ref-1", "txn-9").await;

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for i in 0..10 {
            let service = Arc::clone(&h.service);
            let barrier = Arc::clone(&barrier);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if i % 2 == 0 {
                    service
                        .handle_browser_return(PaymentMethod::PayPal, "ref-1", user)
                        .await
                        .map(|_| ())
                } else {
                    service.webhooks.handle_event(approval("ref-1")).await.map(|_| ())
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.provider.confirm_calls(), 1, "Provider captured more than once");
        assert_eq!(h.store.transactions().len(), 1);
        assert_eq!(
            h.service
                .get_subscription_status(user)
                .await
                .unwrap()
                .unwrap()
                .status,
            SubscriptionStatus::Active
        );
    }

    // =========================================================================
    // Capture webhook redelivered N times
    // =========================================================================
    #[tokio::test]
    async fn test_redelivered_capture_is_duplicate() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.checkout(user, "ref-1", "txn-9").await;

        let mut outcomes = vec![];
        for _ in 0..4 {
            outcomes.push(
                h.service
                    .webhooks
                    .handle_event(capture("ref-1", "txn-9"))
                    .await
                    .unwrap(),
            );
        }

        assert!(matches!(
            outcomes[0],
            DeliveryOutcome::Applied(ConfirmationResult::Activated(_))
        ));
        assert!(outcomes[1..]
            .iter()
            .all(|o| *o == DeliveryOutcome::Duplicate));
        assert_eq!(h.store.transactions().len(), 1);
        assert_eq!(h.provider.confirm_calls(), 0);
    }

    // =========================================================================
    // Stale correlation id: dropped, provider never called
    // =========================================================================
    #[tokio::test]
    async fn test_stale_correlation_dropped() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.checkout(user, "ref-1", "txn-1").await;
        // Re-initiating replaces ref-1 on the record
        h.checkout(user, "ref-2", "txn-2").await;

        let outcome = h.service.webhooks.handle_event(approval("ref-1")).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Dropped);
        assert_eq!(h.provider.confirm_calls(), 0);
        assert!(h.store.transactions().is_empty());
    }

    // =========================================================================
    // Capture arriving after the checkout expired
    // =========================================================================
    #[tokio::test]
    async fn test_capture_after_expiry_recorded_without_activation() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.checkout(user, "ref-1", "txn-9").await;

        let later = time::OffsetDateTime::now_utc() + time::Duration::days(8);
        let expired = h
            .service
            .subscriptions
            .expire_stale_pending(later, h.service.config.pending_checkout_ttl)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);

        let outcome = h
            .service
            .webhooks
            .handle_event(capture("ref-1", "txn-9"))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DeliveryOutcome::Applied(ConfirmationResult::RecordedWithoutActivation(_))
        ));
        assert_eq!(h.store.transactions().len(), 1);
        assert_eq!(
            h.service
                .get_subscription_status(user)
                .await
                .unwrap()
                .unwrap()
                .status,
            SubscriptionStatus::Canceled
        );
    }

    // =========================================================================
    // Fresh pending checkouts survive the expiry job
    // =========================================================================
    #[tokio::test]
    async fn test_expiry_keeps_recent_pending() {
        let h = harness().await;
        h.checkout(Uuid::new_v4(), "ref-1", "txn-1").await;

        assert!(h.service.expire_stale_pending().await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod commission_tests {
    use super::harness::*;
    use crate::commissions::{BillingPeriod, CommissionStatus};
    use crate::store::BillingStore;
    use time::OffsetDateTime;
    use uuid::Uuid;

    // =========================================================================
    // Two qualifying referrals: nothing. Third: all three at once.
    // =========================================================================
    #[tokio::test]
    async fn test_threshold_gating() {
        let h = harness().await;
        let referrer = Uuid::new_v4();
        let referred: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for user in &referred {
            h.store.add_referral(referrer, *user);
        }

        let u1 = h.activate(referred[0], "ref-u1", "txn-u1").await;
        let u2 = h.activate(referred[1], "ref-u2", "txn-u2").await;

        let stats = h.service.get_referral_stats(referrer).await.unwrap();
        assert_eq!(stats.qualifying_referrals, 2);
        assert_eq!(stats.active_commissions, 0);
        assert!(!stats.threshold_reached);

        let u3 = h.activate(referred[2], "ref-u3", "txn-u3").await;

        let stats = h.service.get_referral_stats(referrer).await.unwrap();
        assert!(stats.threshold_reached);
        assert_eq!(stats.active_commissions, 3);
        assert_eq!(stats.current_month_cents, 300);
        assert!(!stats.payout_eligible(), "No bank account on file");

        // Each commission starts at its own subscription's activation
        for sub in [&u1, &u2, &u3] {
            let commission = h
                .store
                .get_commission_by_subscription(sub.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(commission.status, CommissionStatus::Active);
            assert_eq!(Some(commission.start_date), sub.activated_at);
            assert_eq!(commission.monthly_amount_cents, 100);
        }
    }

    // =========================================================================
    // Referrals registered by code count toward the threshold
    // =========================================================================
    #[tokio::test]
    async fn test_referrals_registered_by_code_earn_commissions() {
        let h = harness().await;
        let referrer = Uuid::new_v4();
        let code = h.service.get_referral_code(referrer).await.unwrap();

        for i in 0..3 {
            let user = Uuid::new_v4();
            assert_eq!(
                h.service.register_referral(user, &code).await.unwrap(),
                referrer
            );
            h.activate(user, &format!("ref-c{}", i), &format!("txn-c{}", i))
                .await;
        }

        let stats = h.service.get_referral_stats(referrer).await.unwrap();
        assert_eq!(stats.referred_users, 3);
        assert!(stats.threshold_reached);
        assert_eq!(stats.active_commissions, 3);
    }

    // =========================================================================
    // Cancelling a referred subscription ends only its commission
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_ends_single_commission() {
        let h = harness().await;
        let referrer = Uuid::new_v4();
        let referred: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, user) in referred.iter().enumerate() {
            h.store.add_referral(referrer, *user);
            h.activate(*user, &format!("ref-{}", i), &format!("txn-{}", i))
                .await;
        }

        let canceled = h.service.cancel_subscription(referred[0], true).await.unwrap();

        let ended = h
            .store
            .get_commission_by_subscription(canceled.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ended.status, CommissionStatus::Inactive);
        assert_eq!(ended.end_date, canceled.canceled_at);

        let stats = h.service.get_referral_stats(referrer).await.unwrap();
        assert_eq!(stats.active_commissions, 2);

        let due = h
            .service
            .commission_report(BillingPeriod::containing(OffsetDateTime::now_utc()))
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        assert!(due.iter().all(|c| c.referred_id != referred[0]));
    }

    // =========================================================================
    // Removing the referral link ends the commission
    // =========================================================================
    #[tokio::test]
    async fn test_end_referral() {
        let h = harness().await;
        let referrer = Uuid::new_v4();
        let referred: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, user) in referred.iter().enumerate() {
            h.store.add_referral(referrer, *user);
            h.activate(*user, &format!("ref-{}", i), &format!("txn-{}", i))
                .await;
        }

        let ended = h.service.end_referral(referred[1]).await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].referred_id, referred[1]);
        assert_eq!(ended[0].status, CommissionStatus::Inactive);
    }

    // =========================================================================
    // Users without a referrer never produce commissions
    // =========================================================================
    #[tokio::test]
    async fn test_unreferred_activation() {
        let h = harness().await;
        for i in 0..4 {
            h.activate(Uuid::new_v4(), &format!("ref-{}", i), &format!("txn-{}", i))
                .await;
        }
        assert!(h
            .service
            .commission_report(BillingPeriod::containing(OffsetDateTime::now_utc()))
            .await
            .unwrap()
            .is_empty());
    }
}
