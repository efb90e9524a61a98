//! Payment provider adapters
//!
//! Every provider sits behind [`PaymentProvider`]. The subscription state
//! machine only ever sees `Arc<dyn PaymentProvider>` through the
//! [`ProviderRegistry`], never a provider SDK type.

pub mod paypal;
pub mod stripe;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

pub use self::paypal::PayPalProvider;
pub use self::stripe::StripeProvider;

/// Which provider a subscription is paid through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Redirect-based order approval followed by an explicit capture
    PayPal,
    /// Hosted Checkout Session
    Stripe,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::PayPal => "paypal",
            PaymentMethod::Stripe => "stripe",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paypal" => Ok(PaymentMethod::PayPal),
            "stripe" => Ok(PaymentMethod::Stripe),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown payment method '{}'",
                other
            ))),
        }
    }
}

/// Result of creating a provider-side payment intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitiatedPayment {
    /// Where the user's browser must go to approve/pay
    pub redirect_url: String,
    /// Provider reference used to correlate later confirmations
    pub correlation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOutcome {
    Captured,
    Rejected,
    /// Payment still processing at the provider (delayed payment methods)
    Pending,
}

/// What the provider reported for a payment intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confirmation {
    pub outcome: CaptureOutcome,
    /// Final transaction id; only present once funds moved
    pub provider_transaction_id: Option<String>,
    /// Minor currency units
    pub amount_cents: i64,
    pub currency: String,
    pub customer_reference: Option<String>,
    /// Provider's reason when rejected
    pub failure_reason: Option<String>,
}

impl Confirmation {
    pub fn captured(transaction_id: impl Into<String>, amount_cents: i64, currency: &str) -> Self {
        Self {
            outcome: CaptureOutcome::Captured,
            provider_transaction_id: Some(transaction_id.into()),
            amount_cents,
            currency: currency.to_uppercase(),
            customer_reference: None,
            failure_reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            outcome: CaptureOutcome::Rejected,
            provider_transaction_id: None,
            amount_cents: 0,
            currency: String::new(),
            customer_reference: None,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn pending() -> Self {
        Self {
            outcome: CaptureOutcome::Pending,
            provider_transaction_id: None,
            amount_cents: 0,
            currency: String::new(),
            customer_reference: None,
            failure_reason: None,
        }
    }

    pub fn with_customer(mut self, customer_reference: Option<String>) -> Self {
        self.customer_reference = customer_reference;
        self
    }

    pub fn is_captured(&self) -> bool {
        self.outcome == CaptureOutcome::Captured
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == CaptureOutcome::Pending
    }
}

/// An inbound webhook delivery, already authenticated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub provider: PaymentMethod,
    /// Provider's event id, used for logging
    pub event_id: Option<String>,
    pub event_type: String,
    /// The event's payload object (Stripe `data.object`, PayPal `resource`)
    pub provider_object: serde_json::Value,
}

/// A webhook mapped onto the engine's terms
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDelivery {
    pub correlation_id: String,
    /// `None` when the event only says "approved" and a capture is still needed
    pub confirmation: Option<Confirmation>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Create a payment intent for `plan` and return where to send the user
    async fn initiate(&self, user_id: Uuid, plan: &Plan) -> BillingResult<InitiatedPayment>;

    /// Finalise a payment intent.
    ///
    /// For capture-style providers this moves funds, so callers must
    /// serialize calls per correlation id.
    async fn confirm(&self, correlation_id: &str) -> BillingResult<Confirmation>;

    /// Map a webhook onto a correlation id. `Ok(None)` means the event type
    /// is acknowledged and ignored.
    fn interpret_event(&self, event: &WebhookEvent) -> BillingResult<Option<ProviderDelivery>>;
}

/// Configured providers keyed by payment method
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> BillingResult<Arc<dyn PaymentProvider>> {
        self.providers.get(&method).cloned().ok_or_else(|| {
            BillingError::ProviderUnavailable(format!("{} is not configured", method))
        })
    }

    pub fn configured(&self) -> Vec<PaymentMethod> {
        let mut methods: Vec<PaymentMethod> = self.providers.keys().copied().collect();
        methods.sort_by_key(|m| m.as_str());
        methods
    }
}

/// Minor units to a two-decimal string (2000 -> "20.00")
pub fn minor_to_decimal(amount_cents: i64) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let abs = amount_cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Decimal string back to minor units ("20.00" -> 2000, "20.5" -> 2050)
pub fn decimal_to_minor(value: &str) -> BillingResult<i64> {
    let invalid = || BillingError::InvalidInput(format!("Invalid amount '{}'", value));
    let trimmed = value.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() || fraction.len() > 2 {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let fraction: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => fraction.parse().map_err(|_| invalid())?,
    };

    let cents = whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(invalid)?;
    Ok(if negative { -cents } else { cents })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_to_decimal() {
        assert_eq!(minor_to_decimal(2000), "20.00");
        assert_eq!(minor_to_decimal(5), "0.05");
        assert_eq!(minor_to_decimal(-150), "-1.50");
    }

    #[test]
    fn test_decimal_to_minor() {
        assert_eq!(decimal_to_minor("20.00").unwrap(), 2000);
        assert_eq!(decimal_to_minor("20.5").unwrap(), 2050);
        assert_eq!(decimal_to_minor("7").unwrap(), 700);
        assert_eq!(decimal_to_minor(" 0.99 ").unwrap(), 99);
    }

    #[test]
    fn test_decimal_to_minor_rejects_garbage() {
        assert!(decimal_to_minor("20.001").is_err());
        assert!(decimal_to_minor("abc").is_err());
        assert!(decimal_to_minor(".50").is_err());
        assert!(decimal_to_minor("1e3").is_err());
    }

    #[test]
    fn test_registry_reports_missing_provider() {
        let registry = ProviderRegistry::new();
        match registry.get(PaymentMethod::PayPal) {
            Err(BillingError::ProviderUnavailable(msg)) => assert!(msg.contains("paypal")),
            other => panic!("expected ProviderUnavailable, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_payment_method_round_trip_names() {
        assert_eq!("paypal".parse::<PaymentMethod>().unwrap(), PaymentMethod::PayPal);
        assert_eq!(PaymentMethod::Stripe.to_string(), "stripe");
        assert!("cash".parse::<PaymentMethod>().is_err());
    }
}
