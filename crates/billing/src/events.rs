//! Billing event log
//!
//! Append-only audit trail of everything the engine decided, including the
//! payment attempts that never reach the ledger.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    SubscriptionInitiated,
    PaymentCaptured,
    PaymentRejected,
    CancellationScheduled,
    SubscriptionCanceled,
    CheckoutExpired,
    CommissionActivated,
    CommissionEnded,
    ReferralRegistered,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionInitiated => "subscription_initiated",
            BillingEventType::PaymentCaptured => "payment_captured",
            BillingEventType::PaymentRejected => "payment_rejected",
            BillingEventType::CancellationScheduled => "cancellation_scheduled",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::CheckoutExpired => "checkout_expired",
            BillingEventType::CommissionActivated => "commission_activated",
            BillingEventType::CommissionEnded => "commission_ended",
            BillingEventType::ReferralRegistered => "referral_registered",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingEventType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s {
            "subscription_initiated" => BillingEventType::SubscriptionInitiated,
            "payment_captured" => BillingEventType::PaymentCaptured,
            "payment_rejected" => BillingEventType::PaymentRejected,
            "cancellation_scheduled" => BillingEventType::CancellationScheduled,
            "subscription_canceled" => BillingEventType::SubscriptionCanceled,
            "checkout_expired" => BillingEventType::CheckoutExpired,
            "commission_activated" => BillingEventType::CommissionActivated,
            "commission_ended" => BillingEventType::CommissionEnded,
            "referral_registered" => BillingEventType::ReferralRegistered,
            other => {
                return Err(BillingError::Internal(format!(
                    "Unknown billing event type '{}'",
                    other
                )))
            }
        };
        Ok(event_type)
    }
}

/// Who caused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Provider,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Provider => "provider",
            ActorType::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub event_type: BillingEventType,
    pub actor_type: ActorType,
    pub data: Value,
    pub created_at: OffsetDateTime,
}

pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    subscription_id: Option<Uuid>,
    actor_type: ActorType,
    data: Value,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            subscription_id: None,
            actor_type: ActorType::System,
            data: Value::Object(Default::default()),
        }
    }

    pub fn subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn build(self) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            subscription_id: self.subscription_id,
            event_type: self.event_type,
            actor_type: self.actor_type,
            data: self.data,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn BillingStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        let event = builder.build();
        self.store.append_event(&event).await?;

        tracing::debug!(
            user_id = %event.user_id,
            event_type = %event.event_type,
            actor = event.actor_type.as_str(),
            "Billing event logged"
        );
        Ok(())
    }

    /// Log, and only warn on failure. The audit trail never blocks a
    /// billing transition.
    pub async fn log_or_warn(&self, builder: BillingEventBuilder) {
        let event_type = builder.event_type;
        if let Err(e) = self.log_event(builder).await {
            tracing::warn!(error = %e, event_type = %event_type, "Failed to log billing event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBillingStore;

    #[test]
    fn test_event_type_names_round_trip() {
        for event_type in [
            BillingEventType::PaymentRejected,
            BillingEventType::CheckoutExpired,
            BillingEventType::CommissionEnded,
        ] {
            assert_eq!(event_type.as_str().parse::<BillingEventType>().unwrap(), event_type);
        }
        assert!("refund_issued".parse::<BillingEventType>().is_err());
    }

    #[tokio::test]
    async fn test_logger_appends_to_store() {
        let store = Arc::new(InMemoryBillingStore::new());
        let logger = BillingEventLogger::new(store.clone());
        let user_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();

        logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::PaymentRejected)
                    .subscription(subscription_id)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({"reason": "INSTRUMENT_DECLINED"})),
            )
            .await
            .unwrap();

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subscription_id, Some(subscription_id));
        assert_eq!(events[0].data["reason"], "INSTRUMENT_DECLINED");
    }
}
