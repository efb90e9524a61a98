//! Scripted payment provider for tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{
    Confirmation, InitiatedPayment, PaymentMethod, PaymentProvider, ProviderDelivery, WebhookEvent,
};
use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

/// A provider whose answers are queued up front.
///
/// `initiate` hands out the queued correlation ids in order (or
/// `mock-ref-N` once the queue is empty). `confirm` answers with the
/// confirmation registered for that correlation id and counts every call.
/// Webhooks use the shape `{"correlation_id": .., "transaction_id": ..,
/// "amount_cents": .., "rejected": bool}`.
pub struct MockProvider {
    method: PaymentMethod,
    correlation_ids: Mutex<VecDeque<String>>,
    confirmations: Mutex<HashMap<String, Confirmation>>,
    fail_initiate: Mutex<bool>,
    confirm_delay: Duration,
    initiate_calls: AtomicUsize,
    confirm_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            correlation_ids: Mutex::new(VecDeque::new()),
            confirmations: Mutex::new(HashMap::new()),
            fail_initiate: Mutex::new(false),
            confirm_delay: Duration::ZERO,
            initiate_calls: AtomicUsize::new(0),
            confirm_calls: AtomicUsize::new(0),
        }
    }

    /// Sleep inside `confirm` so concurrent callers overlap
    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    pub fn queue_correlation_id(&self, correlation_id: &str) {
        self.correlation_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(correlation_id.to_string());
    }

    pub fn set_confirmation(&self, correlation_id: &str, confirmation: Confirmation) {
        self.confirmations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(correlation_id.to_string(), confirmation);
    }

    pub fn fail_initiate(&self, fail: bool) {
        *self.fail_initiate.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn confirm_calls(&self) -> usize {
        self.confirm_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn initiate(&self, _user_id: Uuid, plan: &Plan) -> BillingResult<InitiatedPayment> {
        let n = self.initiate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_initiate.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(BillingError::ProviderUnavailable(format!(
                "{}: scripted outage",
                self.method
            )));
        }

        let correlation_id = self
            .correlation_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| format!("mock-ref-{}", n));

        Ok(InitiatedPayment {
            redirect_url: format!(
                "https://{}.example/pay/{}?plan={}",
                self.method, correlation_id, plan.id
            ),
            correlation_id,
        })
    }

    async fn confirm(&self, correlation_id: &str) -> BillingResult<Confirmation> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        if !self.confirm_delay.is_zero() {
            tokio::time::sleep(self.confirm_delay).await;
        }

        self.confirmations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(correlation_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::ProviderUnavailable(format!(
                    "{}: no scripted confirmation for {}",
                    self.method, correlation_id
                ))
            })
    }

    fn interpret_event(&self, event: &WebhookEvent) -> BillingResult<Option<ProviderDelivery>> {
        if event.event_type != "payment.confirmed" {
            return Ok(None);
        }

        let object = &event.provider_object;
        let correlation_id = object
            .get("correlation_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::InvalidInput("missing correlation_id".into()))?
            .to_string();

        let confirmation = if object.get("rejected").and_then(Value::as_bool) == Some(true) {
            Some(Confirmation::rejected("declined"))
        } else {
            object.get("transaction_id").and_then(Value::as_str).map(|tx| {
                let amount = object.get("amount_cents").and_then(Value::as_i64).unwrap_or(0);
                Confirmation::captured(tx, amount, "EUR")
            })
        };

        Ok(Some(ProviderDelivery {
            correlation_id,
            confirmation,
        }))
    }
}
