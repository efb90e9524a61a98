//! Stripe Checkout adapter
//!
//! Initiation creates a one-off Checkout Session priced from the plan.
//! Confirmation is either the `checkout.session.*` webhook or a session
//! lookup when the browser returns.

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use ::stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus,
    CheckoutSessionStatus, Client, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    Currency, Expandable, Webhook,
};

use super::{
    Confirmation, InitiatedPayment, PaymentMethod, PaymentProvider, ProviderDelivery, WebhookEvent,
};
use crate::config::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const EVENT_ASYNC_PAYMENT_FAILED: &str = "checkout.session.async_payment_failed";
pub const EVENT_SESSION_EXPIRED: &str = "checkout.session.expired";

/// Signed timestamps older than this are refused
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct StripeProvider {
    client: Client,
    config: StripeConfig,
}

impl StripeProvider {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Verify the `Stripe-Signature` header against the endpoint secret and
    /// parse the event.
    ///
    /// async-stripe's verifier runs first. It also deserializes the event
    /// into its own types and fails on API versions newer than the crate,
    /// so a failure falls back to checking the HMAC directly.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        let secret = self.config.webhook_secret.as_deref().ok_or_else(|| {
            BillingError::Config("STRIPE_WEBHOOK_SECRET is required to verify webhooks".into())
        })?;

        match Webhook::construct_event(payload, signature, secret) {
            Ok(event) => {
                tracing::debug!(event_id = %event.id, "Stripe webhook verified");
                return parse_event(payload);
            }
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, secret, now)?;
        parse_event(payload)
    }
}

/// Check a `t=<ts>,v1=<hex>` signature header at time `now` (unix seconds)
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in Stripe-Signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in Stripe-Signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Stripe webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let matched = signatures.iter().any(|candidate| {
        let Ok(bytes) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&bytes).is_ok()
    });

    if !matched {
        tracing::warn!(
            candidates = signatures.len(),
            "Stripe webhook signature mismatch"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// An unpaid session is only final once Stripe expired it. Delayed payment
/// methods stay unpaid until `checkout.session.async_payment_*` arrives.
fn unpaid_session_outcome(status: Option<CheckoutSessionStatus>) -> Confirmation {
    match status {
        Some(CheckoutSessionStatus::Expired) => {
            Confirmation::rejected("checkout session expired before payment")
        }
        _ => Confirmation::pending(),
    }
}

/// Parse a Stripe event body into a [`WebhookEvent`]
pub fn parse_event(payload: &str) -> BillingResult<WebhookEvent> {
    let event: Value = serde_json::from_str(payload)?;
    let event_type = event
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::InvalidInput("Stripe event without type".into()))?
        .to_string();

    Ok(WebhookEvent {
        provider: PaymentMethod::Stripe,
        event_id: event.get("id").and_then(Value::as_str).map(str::to_string),
        event_type,
        provider_object: event.pointer("/data/object").cloned().unwrap_or(Value::Null),
    })
}

/// `payment_intent` is either an id or an expanded object
fn payment_intent_id(session: &Value) -> Option<&str> {
    match session.get("payment_intent") {
        Some(Value::String(id)) => Some(id.as_str()),
        Some(Value::Object(obj)) => obj.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn captured_from_session_json(session_id: &str, session: &Value) -> Confirmation {
    let transaction_id = payment_intent_id(session).unwrap_or(session_id);
    let amount = session.get("amount_total").and_then(Value::as_i64).unwrap_or(0);
    let currency = session.get("currency").and_then(Value::as_str).unwrap_or_default();
    let customer = match session.get("customer") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Object(obj)) => obj.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    Confirmation::captured(transaction_id, amount, currency).with_customer(customer)
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Stripe
    }

    async fn initiate(&self, user_id: Uuid, plan: &Plan) -> BillingResult<InitiatedPayment> {
        let currency: Currency = plan.currency.to_lowercase().parse().map_err(|_| {
            BillingError::InvalidInput(format!("Unsupported currency '{}'", plan.currency))
        })?;

        let user_ref = user_id.to_string();
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_ref.clone());
        metadata.insert("plan_id".to_string(), plan.id.to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Payment);
        params.success_url = Some(&self.config.success_url);
        params.cancel_url = Some(&self.config.cancel_url);
        params.client_reference_id = Some(&user_ref);
        params.metadata = Some(metadata);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(plan.price_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: plan.name.clone(),
                    description: plan.description.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let session = CheckoutSession::create(&self.client, params).await?;
        let url = session.url.ok_or_else(|| {
            BillingError::ProviderUnavailable(format!(
                "stripe: session {} returned no checkout URL",
                session.id
            ))
        })?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan.id,
            session_id = %session.id,
            "Stripe checkout session created"
        );

        Ok(InitiatedPayment {
            redirect_url: url,
            correlation_id: session.id.to_string(),
        })
    }

    async fn confirm(&self, correlation_id: &str) -> BillingResult<Confirmation> {
        let session_id: CheckoutSessionId = correlation_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("Invalid checkout session id '{}'", correlation_id))
        })?;
        let session = CheckoutSession::retrieve(&self.client, &session_id, &[]).await?;

        if session.payment_status != CheckoutSessionPaymentStatus::Paid {
            tracing::info!(
                session_id = %correlation_id,
                status = ?session.status,
                payment_status = ?session.payment_status,
                "Checkout session not paid"
            );
            return Ok(unpaid_session_outcome(session.status));
        }

        let transaction_id = match &session.payment_intent {
            Some(Expandable::Id(id)) => id.to_string(),
            Some(Expandable::Object(intent)) => intent.id.to_string(),
            None => correlation_id.to_string(),
        };
        let customer = session.customer.as_ref().map(|c| match c {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        });
        let currency = session
            .currency
            .map(|c| c.to_string())
            .unwrap_or_default();

        Ok(
            Confirmation::captured(transaction_id, session.amount_total.unwrap_or(0), &currency)
                .with_customer(customer),
        )
    }

    fn interpret_event(&self, event: &WebhookEvent) -> BillingResult<Option<ProviderDelivery>> {
        let session = &event.provider_object;
        let session_id = || {
            session
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    BillingError::InvalidInput(format!("{} without session id", event.event_type))
                })
        };

        let delivery = match event.event_type.as_str() {
            EVENT_SESSION_COMPLETED | EVENT_ASYNC_PAYMENT_SUCCEEDED => {
                let id = session_id()?;
                // Delayed payment methods complete unpaid and follow up with
                // async_payment_succeeded.
                if session.get("payment_status").and_then(Value::as_str) != Some("paid") {
                    tracing::info!(session_id = %id, "Checkout completed but not paid yet");
                    return Ok(None);
                }
                let confirmation = captured_from_session_json(&id, session);
                ProviderDelivery {
                    correlation_id: id,
                    confirmation: Some(confirmation),
                }
            }
            EVENT_ASYNC_PAYMENT_FAILED => ProviderDelivery {
                correlation_id: session_id()?,
                confirmation: Some(Confirmation::rejected("async payment failed")),
            },
            EVENT_SESSION_EXPIRED => ProviderDelivery {
                correlation_id: session_id()?,
                confirmation: Some(Confirmation::rejected("checkout session expired")),
            },
            _ => return Ok(None),
        };

        Ok(Some(delivery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn provider() -> StripeProvider {
        StripeProvider::new(StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: Some(SECRET.to_string()),
            success_url: "https://app.example.com/billing/ok".to_string(),
            cancel_url: "https://app.example.com/billing/cancel".to_string(),
        })
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1","type":"checkout.session.completed"}"#;
        let now = 1_760_000_000;
        assert!(verify_signature(payload, &sign(payload, now), SECRET, now + 10).is_ok());
    }

    #[test]
    fn test_stale_signature_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_760_000_000;
        assert!(matches!(
            verify_signature(payload, &sign(payload, signed_at), SECRET, signed_at + 301),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_760_000_000;
        let header = sign(r#"{"amount":2000}"#, now);
        assert!(verify_signature(r#"{"amount":1}"#, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature("{}", "v1=abcd", SECRET, 0).is_err());
        assert!(verify_signature("{}", "t=0", SECRET, 0).is_err());
        assert!(verify_signature("{}", "t=0,v1=not-hex", SECRET, 0).is_err());
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let payload = r#"{"id":"evt_2"}"#;
        let now = 1_760_000_000;
        let good = sign(payload, now);
        let header = format!("t={},v1=deadbeef,{}", now, good.split_once(',').unwrap().1);
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_completed_paid_session_carries_confirmation() {
        let event = parse_event(
            &json!({
                "id": "evt_1",
                "type": "checkout.session.completed",
                "data": {"object": {
                    "id": "cs_test_1",
                    "payment_status": "paid",
                    "payment_intent": "pi_123",
                    "amount_total": 2000,
                    "currency": "eur",
                    "customer": "cus_9"
                }}
            })
            .to_string(),
        )
        .unwrap();

        let delivery = provider().interpret_event(&event).unwrap().unwrap();
        assert_eq!(delivery.correlation_id, "cs_test_1");
        let confirmation = delivery.confirmation.unwrap();
        assert!(confirmation.is_captured());
        assert_eq!(confirmation.provider_transaction_id.as_deref(), Some("pi_123"));
        assert_eq!(confirmation.amount_cents, 2000);
        assert_eq!(confirmation.currency, "EUR");
        assert_eq!(confirmation.customer_reference.as_deref(), Some("cus_9"));
    }

    #[test]
    fn test_unpaid_completion_waits_for_async_result() {
        let event = parse_event(
            &json!({
                "type": "checkout.session.completed",
                "data": {"object": {"id": "cs_test_2", "payment_status": "unpaid"}}
            })
            .to_string(),
        )
        .unwrap();
        assert!(provider().interpret_event(&event).unwrap().is_none());
    }

    #[test]
    fn test_failure_events_map_to_rejected() {
        for event_type in [EVENT_ASYNC_PAYMENT_FAILED, EVENT_SESSION_EXPIRED] {
            let event = parse_event(
                &json!({"type": event_type, "data": {"object": {"id": "cs_test_3"}}}).to_string(),
            )
            .unwrap();
            let delivery = provider().interpret_event(&event).unwrap().unwrap();
            assert!(!delivery.confirmation.unwrap().is_captured());
        }
    }

    #[test]
    fn test_unrelated_event_ignored() {
        let event = parse_event(
            &json!({"type": "invoice.paid", "data": {"object": {"id": "in_1"}}}).to_string(),
        )
        .unwrap();
        assert!(provider().interpret_event(&event).unwrap().is_none());
    }

    #[test]
    fn test_verify_event_accepts_payload_async_stripe_cannot_parse() {
        // Minimal body; the typed verifier fails to deserialize it and the
        // HMAC check still authenticates it
        let payload = json!({
            "id": "evt_5",
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_test_5", "payment_status": "paid"}}
        })
        .to_string();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let event = provider().verify_event(&payload, &sign(&payload, now)).unwrap();
        assert_eq!(event.event_id.as_deref(), Some("evt_5"));
        assert_eq!(event.event_type, EVENT_SESSION_COMPLETED);
    }

    #[test]
    fn test_verify_event_rejects_bad_signature_on_both_paths() {
        let payload = json!({"id": "evt_6", "type": "checkout.session.completed"}).to_string();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("t={},v1={}", now, "00".repeat(32));

        assert!(matches!(
            provider().verify_event(&payload, &header),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_unpaid_session_is_pending_until_expired() {
        assert!(unpaid_session_outcome(Some(CheckoutSessionStatus::Open)).is_pending());
        assert!(unpaid_session_outcome(Some(CheckoutSessionStatus::Complete)).is_pending());
        assert!(unpaid_session_outcome(None).is_pending());

        let expired = unpaid_session_outcome(Some(CheckoutSessionStatus::Expired));
        assert!(!expired.is_pending());
        assert!(!expired.is_captured());
        assert!(expired.failure_reason.is_some());
    }
}
