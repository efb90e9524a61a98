//! Transaction ledger
//!
//! Append-only record of money that actually moved. One entry per provider
//! transaction id; failed attempts live in the billing event log instead.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::providers::{Confirmation, PaymentMethod};
use crate::store::BillingStore;
use crate::subscriptions::Subscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(TransactionStatus::Completed),
            other => Err(BillingError::Internal(format!(
                "Unknown transaction status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_method: PaymentMethod,
    pub provider_transaction_id: String,
    pub correlation_id: String,
    pub description: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct TransactionLedger {
    store: Arc<dyn BillingStore>,
}

impl TransactionLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Append a captured payment for `subscription`.
    ///
    /// Returns `Ok(false)` when the provider transaction id is already in the
    /// ledger; a repeated capture is success, not an error.
    pub async fn record_capture(
        &self,
        subscription: &Subscription,
        correlation_id: &str,
        confirmation: &Confirmation,
        description: &str,
    ) -> BillingResult<bool> {
        let provider_transaction_id = confirmation.provider_transaction_id.clone().ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "captured confirmation for {} has no transaction id",
                correlation_id
            ))
        })?;

        if confirmation.amount_cents <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "captured amount for {} must be positive, got {}",
                provider_transaction_id, confirmation.amount_cents
            )));
        }

        let transaction = PaymentTransaction {
            id: Uuid::new_v4(),
            user_id: subscription.user_id,
            subscription_id: subscription.id,
            amount_cents: confirmation.amount_cents,
            currency: confirmation.currency.clone(),
            status: TransactionStatus::Completed,
            payment_method: subscription.payment_method,
            provider_transaction_id,
            correlation_id: correlation_id.to_string(),
            description: description.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };

        match self.store.append_transaction(&transaction).await {
            Ok(()) => {
                tracing::info!(
                    user_id = %transaction.user_id,
                    subscription_id = %transaction.subscription_id,
                    provider_transaction_id = %transaction.provider_transaction_id,
                    amount_cents = transaction.amount_cents,
                    currency = %transaction.currency,
                    "Ledger entry appended"
                );
                Ok(true)
            }
            Err(BillingError::DuplicateTransaction(id)) => {
                tracing::info!(
                    provider_transaction_id = %id,
                    "Transaction already in ledger, skipping"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, provider_transaction_id: &str) -> BillingResult<bool> {
        Ok(self
            .store
            .get_transaction_by_provider_id(provider_transaction_id)
            .await?
            .is_some())
    }

    pub async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<PaymentTransaction>> {
        self.store.get_transaction_by_correlation_id(correlation_id).await
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PaymentTransaction>> {
        self.store.list_transactions_by_user(user_id).await
    }
}
