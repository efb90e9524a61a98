//! Webhook and browser-return reconciliation
//!
//! Provider webhooks and the user's browser coming back from checkout are
//! two deliveries of the same fact. Either may arrive late, twice, out of
//! order or never. Every delivery for a correlation id runs under one lock,
//! and the ledger is consulted after the lock is taken, so the first
//! delivery applies the payment and the rest are no-ops that never reach
//! the provider's capture endpoint again.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::locks::KeyedLocks;
use crate::providers::paypal::PayPalSignatureHeaders;
use crate::providers::{
    Confirmation, PayPalProvider, PaymentMethod, PaymentProvider, StripeProvider, WebhookEvent,
};
use crate::subscriptions::{
    ConfirmationResult, Subscription, SubscriptionService, SubscriptionStatus,
};
use uuid::Uuid;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The confirmation changed state (or recorded a rejection)
    Applied(ConfirmationResult),
    /// Already in the ledger
    Duplicate,
    /// Event type the engine does not act on
    Ignored,
    /// No subscription carries this correlation id
    Dropped,
}

pub struct WebhookHandler {
    subscriptions: Arc<SubscriptionService>,
    correlation_locks: KeyedLocks,
    stripe: Option<Arc<StripeProvider>>,
    paypal: Option<Arc<PayPalProvider>>,
}

impl WebhookHandler {
    pub fn new(subscriptions: Arc<SubscriptionService>) -> Self {
        Self {
            subscriptions,
            correlation_locks: KeyedLocks::new(),
            stripe: None,
            paypal: None,
        }
    }

    /// Enable signature checks for Stripe deliveries
    pub fn with_stripe(mut self, stripe: Arc<StripeProvider>) -> Self {
        self.stripe = Some(stripe);
        self
    }

    /// Enable signature checks for PayPal deliveries
    pub fn with_paypal(mut self, paypal: Arc<PayPalProvider>) -> Self {
        self.paypal = Some(paypal);
        self
    }

    /// Verify a raw Stripe delivery and reconcile it
    pub async fn handle_stripe_webhook(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<DeliveryOutcome> {
        let stripe = self.stripe.as_ref().ok_or_else(|| {
            BillingError::ProviderUnavailable("stripe is not configured".to_string())
        })?;
        let event = stripe.verify_event(payload, signature)?;
        self.handle_event(event).await
    }

    /// Verify a raw PayPal delivery and reconcile it
    pub async fn handle_paypal_webhook(
        &self,
        headers: &PayPalSignatureHeaders,
        payload: &str,
    ) -> BillingResult<DeliveryOutcome> {
        let paypal = self.paypal.as_ref().ok_or_else(|| {
            BillingError::ProviderUnavailable("paypal is not configured".to_string())
        })?;
        let event = paypal.verify_event(headers, payload).await?;
        self.handle_event(event).await
    }

    /// Reconcile an authenticated webhook event
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<DeliveryOutcome> {
        let provider = self.subscriptions.providers().get(event.provider)?;

        let Some(delivery) = provider.interpret_event(&event)? else {
            tracing::debug!(
                provider = %event.provider,
                event_id = ?event.event_id,
                event_type = %event.event_type,
                "Ignoring webhook event"
            );
            return Ok(DeliveryOutcome::Ignored);
        };

        tracing::info!(
            provider = %event.provider,
            event_id = ?event.event_id,
            event_type = %event.event_type,
            correlation_id = %delivery.correlation_id,
            "Processing webhook event"
        );

        self.reconcile(
            provider.as_ref(),
            &delivery.correlation_id,
            delivery.confirmation,
        )
        .await
    }

    /// The user came back from the provider's checkout page.
    ///
    /// Returns the subscription as it stands after reconciliation; a payment
    /// the provider is still processing leaves it `pending`. A declined
    /// payment surfaces as `ConfirmationRejected`.
    pub async fn handle_browser_return(
        &self,
        method: PaymentMethod,
        correlation_id: &str,
        user_id: Uuid,
    ) -> BillingResult<Subscription> {
        let provider = self.subscriptions.providers().get(method)?;

        match self.subscriptions.find_by_correlation(correlation_id).await? {
            Some(sub) if sub.user_id == user_id => {}
            Some(sub) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    user_id = %user_id,
                    owner_id = %sub.user_id,
                    "Browser return for a subscription owned by another user"
                );
                return Err(BillingError::SubscriptionNotFound(correlation_id.to_string()));
            }
            None => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    user_id = %user_id,
                    "Browser return for unknown correlation id"
                );
                return Err(BillingError::SubscriptionNotFound(correlation_id.to_string()));
            }
        }

        match self.reconcile(provider.as_ref(), correlation_id, None).await? {
            DeliveryOutcome::Applied(ConfirmationResult::Rejected { reason, .. }) => {
                Err(BillingError::ConfirmationRejected(reason))
            }
            DeliveryOutcome::Applied(result) => Ok(result.subscription().clone()),
            DeliveryOutcome::Duplicate | DeliveryOutcome::Dropped | DeliveryOutcome::Ignored => self
                .subscriptions
                .find_by_correlation(correlation_id)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(correlation_id.to_string())),
        }
    }

    /// Apply one delivery for `correlation_id`. `known` is the outcome when
    /// the delivery carried it; otherwise the provider is asked (which
    /// captures, for PayPal).
    async fn reconcile(
        &self,
        provider: &dyn PaymentProvider,
        correlation_id: &str,
        known: Option<Confirmation>,
    ) -> BillingResult<DeliveryOutcome> {
        let _guard = self
            .correlation_locks
            .lock(format!("{}:{}", provider.method(), correlation_id))
            .await;

        let Some(subscription) = self.subscriptions.find_by_correlation(correlation_id).await?
        else {
            tracing::warn!(
                provider = %provider.method(),
                correlation_id = %correlation_id,
                "Dropping confirmation for unknown correlation id"
            );
            return Ok(DeliveryOutcome::Dropped);
        };

        let ledger = self.subscriptions.ledger();
        if let Some(recorded) = ledger.find_by_correlation(correlation_id).await? {
            if subscription.status != SubscriptionStatus::Pending {
                tracing::info!(
                    correlation_id = %correlation_id,
                    provider_transaction_id = %recorded.provider_transaction_id,
                    "Confirmation already recorded"
                );
                return Ok(DeliveryOutcome::Duplicate);
            }

            // Ledger written but the activation never landed; finish it from
            // the ledger without touching the provider.
            tracing::warn!(
                correlation_id = %correlation_id,
                subscription_id = %subscription.id,
                "Completing activation from existing ledger entry"
            );
            let replay = Confirmation::captured(
                recorded.provider_transaction_id,
                recorded.amount_cents,
                &recorded.currency,
            );
            return self.apply(correlation_id, &replay).await;
        }

        if let Some(tx_id) = known
            .as_ref()
            .and_then(|c| c.provider_transaction_id.as_deref())
        {
            if ledger.exists(tx_id).await? {
                tracing::info!(
                    provider_transaction_id = %tx_id,
                    "Transaction already recorded"
                );
                return Ok(DeliveryOutcome::Duplicate);
            }
        }

        let confirmation = match known {
            Some(confirmation) => confirmation,
            None => provider.confirm(correlation_id).await?,
        };

        self.apply(correlation_id, &confirmation).await
    }

    async fn apply(
        &self,
        correlation_id: &str,
        confirmation: &Confirmation,
    ) -> BillingResult<DeliveryOutcome> {
        match self
            .subscriptions
            .confirm_payment(correlation_id, confirmation)
            .await
        {
            Ok(result) => Ok(DeliveryOutcome::Applied(result)),
            Err(e) if e.is_stale_confirmation() => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Stale confirmation absorbed"
                );
                Ok(match e {
                    BillingError::DuplicateTransaction(_) => DeliveryOutcome::Duplicate,
                    _ => DeliveryOutcome::Dropped,
                })
            }
            Err(e) => Err(e),
        }
    }
}
