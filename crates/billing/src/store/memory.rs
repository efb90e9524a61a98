//! In-memory store for tests and local runs

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::BillingStore;
use crate::commissions::{BankAccount, Commission, CommissionStatus};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::ledger::PaymentTransaction;
use crate::subscriptions::{Subscription, SubscriptionStatus};

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<Uuid, Subscription>,
    transactions: Vec<PaymentTransaction>,
    /// referred user -> referrer
    referrals: HashMap<Uuid, Uuid>,
    /// user -> referral code
    referral_codes: HashMap<Uuid, String>,
    bank_accounts: HashMap<Uuid, BankAccount>,
    /// keyed by subscription id
    commissions: HashMap<Uuid, Commission>,
    events: Vec<BillingEvent>,
}

/// Everything behind one mutex, so each trait call is atomic
#[derive(Default)]
pub struct InMemoryBillingStore {
    inner: Mutex<Inner>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_referral(&self, referrer_id: Uuid, referred_id: Uuid) {
        self.lock().referrals.insert(referred_id, referrer_id);
    }

    pub fn remove_referral(&self, referred_id: Uuid) {
        self.lock().referrals.remove(&referred_id);
    }

    pub fn add_bank_account(&self, account: BankAccount) {
        self.lock().bank_accounts.insert(account.id, account);
    }

    pub fn events(&self) -> Vec<BillingEvent> {
        self.lock().events.clone()
    }

    pub fn transactions(&self) -> Vec<PaymentTransaction> {
        self.lock().transactions.clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.lock().subscriptions.values().cloned().collect()
    }
}

fn newest_first(mut subscriptions: Vec<Subscription>) -> Vec<Subscription> {
    subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    subscriptions
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_subscription_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.is_open())
            .cloned())
    }

    async fn get_subscription_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.correlation_id.as_deref() == Some(correlation_id))
            .cloned())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.lock().subscriptions.get(&id).cloned())
    }

    async fn list_subscriptions_by_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let subscriptions = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        Ok(newest_first(subscriptions))
    }

    async fn list_subscriptions_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut inner = self.lock();
        let mut record = subscription.clone();

        if record.is_open() {
            let other_open = inner
                .subscriptions
                .values()
                .find(|s| s.user_id == record.user_id && s.is_open() && s.id != record.id)
                .cloned();
            if let Some(existing) = other_open {
                record.id = existing.id;
                record.created_at = existing.created_at;
                record.activated_at = existing.activated_at.or(record.activated_at);
            }
        }

        inner.subscriptions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn activate_subscription(
        &self,
        subscription: &Subscription,
        correlation_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let mut inner = self.lock();
        let Some(stored) = inner.subscriptions.get_mut(&subscription.id) else {
            return Ok(None);
        };
        if stored.status != SubscriptionStatus::Pending
            || stored.correlation_id.as_deref() != Some(correlation_id)
        {
            return Ok(None);
        }

        stored.status = SubscriptionStatus::Active;
        stored.activated_at = stored.activated_at.or(subscription.activated_at);
        if subscription.customer_reference.is_some() {
            stored.customer_reference = subscription.customer_reference.clone();
        }
        stored.updated_at = subscription.updated_at;
        Ok(Some(stored.clone()))
    }

    async fn append_transaction(&self, transaction: &PaymentTransaction) -> BillingResult<()> {
        let mut inner = self.lock();
        if inner
            .transactions
            .iter()
            .any(|t| t.provider_transaction_id == transaction.provider_transaction_id)
        {
            return Err(BillingError::DuplicateTransaction(
                transaction.provider_transaction_id.clone(),
            ));
        }
        inner.transactions.push(transaction.clone());
        Ok(())
    }

    async fn get_transaction_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> BillingResult<Option<PaymentTransaction>> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .find(|t| t.provider_transaction_id == provider_transaction_id)
            .cloned())
    }

    async fn get_transaction_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<PaymentTransaction>> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .find(|t| t.correlation_id == correlation_id)
            .cloned())
    }

    async fn list_transactions_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<PaymentTransaction>> {
        let mut transactions: Vec<PaymentTransaction> = self
            .lock()
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    async fn referrer_of(&self, user_id: Uuid) -> BillingResult<Option<Uuid>> {
        Ok(self.lock().referrals.get(&user_id).copied())
    }

    async fn list_referred_users(&self, referrer_id: Uuid) -> BillingResult<Vec<Uuid>> {
        Ok(self
            .lock()
            .referrals
            .iter()
            .filter(|(_, referrer)| **referrer == referrer_id)
            .map(|(referred, _)| *referred)
            .collect())
    }

    async fn set_referrer(&self, referred_id: Uuid, referrer_id: Uuid) -> BillingResult<bool> {
        let mut inner = self.lock();
        if inner.referrals.contains_key(&referred_id) {
            return Ok(false);
        }
        inner.referrals.insert(referred_id, referrer_id);
        Ok(true)
    }

    async fn get_referral_code(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.lock().referral_codes.get(&user_id).cloned())
    }

    async fn insert_referral_code(&self, user_id: Uuid, code: &str) -> BillingResult<bool> {
        let mut inner = self.lock();
        if inner.referral_codes.contains_key(&user_id)
            || inner.referral_codes.values().any(|c| c == code)
        {
            return Ok(false);
        }
        inner.referral_codes.insert(user_id, code.to_string());
        Ok(true)
    }

    async fn find_user_by_referral_code(&self, code: &str) -> BillingResult<Option<Uuid>> {
        Ok(self
            .lock()
            .referral_codes
            .iter()
            .find(|(_, c)| c.as_str() == code)
            .map(|(user_id, _)| *user_id))
    }

    async fn has_bank_account(&self, user_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .lock()
            .bank_accounts
            .values()
            .any(|a| a.user_id == user_id))
    }

    async fn upsert_commission(&self, commission: &Commission) -> BillingResult<Commission> {
        let mut inner = self.lock();
        let mut record = commission.clone();
        if let Some(existing) = inner.commissions.get(&record.subscription_id) {
            record.id = existing.id;
            record.created_at = existing.created_at;
        }
        inner
            .commissions
            .insert(record.subscription_id, record.clone());
        Ok(record)
    }

    async fn get_commission_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Commission>> {
        Ok(self.lock().commissions.get(&subscription_id).cloned())
    }

    async fn list_commissions_by_referrer(
        &self,
        referrer_id: Uuid,
    ) -> BillingResult<Vec<Commission>> {
        Ok(self
            .lock()
            .commissions
            .values()
            .filter(|c| c.referrer_id == referrer_id)
            .cloned()
            .collect())
    }

    async fn list_commissions_by_referred(
        &self,
        referred_id: Uuid,
    ) -> BillingResult<Vec<Commission>> {
        Ok(self
            .lock()
            .commissions
            .values()
            .filter(|c| c.referred_id == referred_id)
            .cloned()
            .collect())
    }

    async fn list_active_commissions(&self) -> BillingResult<Vec<Commission>> {
        Ok(self
            .lock()
            .commissions
            .values()
            .filter(|c| c.status == CommissionStatus::Active)
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: &BillingEvent) -> BillingResult<()> {
        self.lock().events.push(event.clone());
        Ok(())
    }
}
