//! Billing error taxonomy

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Credentials missing/invalid, provider outage, or the provider refused
    /// the request. Never retried inside the engine.
    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Provider transaction id already present in the ledger
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("Payment failed, please retry: {0}")]
    ConfirmationRejected(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors that a reconciliation path absorbs instead of reporting back
    /// to the provider (which would only trigger pointless redeliveries).
    pub fn is_stale_confirmation(&self) -> bool {
        matches!(
            self,
            BillingError::SubscriptionNotFound(_) | BillingError::DuplicateTransaction(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::ProviderUnavailable(format!("stripe: {}", err))
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::ProviderUnavailable(format!("http: {}", err))
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidInput(format!("malformed JSON: {}", err))
    }
}

impl From<praxis_shared::EnvError> for BillingError {
    fn from(err: praxis_shared::EnvError) -> Self {
        BillingError::Config(err.to_string())
    }
}

impl From<time::error::ComponentRange> for BillingError {
    fn from(err: time::error::ComponentRange) -> Self {
        BillingError::Internal(format!("date out of range: {}", err))
    }
}
