//! Referral commission accrual
//!
//! A referrer earns a fixed monthly amount for every referred user with an
//! active subscription, but only once enough referred users have ever paid.
//! Below the threshold every referral stays dormant; crossing it activates
//! all of them at once.
//!
//! Paying commissions out is not done here. [`CommissionService::active_unpaid_for_period`]
//! is the input to that process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, Time};
use uuid::Uuid;

use crate::config::CommissionConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::locks::KeyedLocks;
use crate::store::BillingStore;
use crate::subscriptions::{Subscription, SubscriptionStatus};

/// Length of a generated referral code
pub const REFERRAL_CODE_LEN: usize = 8;

const REFERRAL_CODE_ATTEMPTS: usize = 5;

fn new_referral_code() -> String {
    let mut code = Uuid::new_v4().simple().to_string();
    code.truncate(REFERRAL_CODE_LEN);
    code.to_uppercase()
}

/// A calendar month, `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillingPeriod {
    year: i32,
    month: u8,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u8) -> BillingResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(BillingError::InvalidInput(format!(
                "Invalid billing month {}",
                month
            )));
        }
        Ok(Self { year, month })
    }

    /// The period an instant falls into (UTC)
    pub fn containing(at: OffsetDateTime) -> Self {
        let date = at.to_offset(time::UtcOffset::UTC).date();
        Self {
            year: date.year(),
            month: date.month() as u8,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First instant of the month
    pub fn start(&self) -> BillingResult<OffsetDateTime> {
        let date = Date::from_calendar_date(self.year, Month::try_from(self.month)?, 1)?;
        Ok(date.with_time(Time::MIDNIGHT).assume_utc())
    }

    /// First instant of the following month (exclusive)
    pub fn end(&self) -> BillingResult<OffsetDateTime> {
        self.next().start()
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl std::str::FromStr for BillingPeriod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BillingError::InvalidInput(format!("Invalid billing period '{}'", s));
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for BillingPeriod {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BillingPeriod> for String {
    fn from(period: BillingPeriod) -> Self {
        period.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Active,
    Inactive,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionStatus::Active => "active",
            CommissionStatus::Inactive => "inactive",
        }
    }
}

impl std::str::FromStr for CommissionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CommissionStatus::Active),
            "inactive" => Ok(CommissionStatus::Inactive),
            other => Err(BillingError::Internal(format!(
                "Unknown commission status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commission {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub subscription_id: Uuid,
    pub monthly_amount_cents: i64,
    pub status: CommissionStatus,
    pub start_date: OffsetDateTime,
    pub end_date: Option<OffsetDateTime>,
    pub last_paid_period: Option<BillingPeriod>,
    pub created_at: OffsetDateTime,
}

impl Commission {
    /// Whether the commission earns anything during `period`
    pub fn overlaps(&self, period: &BillingPeriod) -> BillingResult<bool> {
        let starts_before_end = self.start_date < period.end()?;
        let period_start = period.start()?;
        Ok(starts_before_end && self.end_date.map_or(true, |end| end >= period_start))
    }
}

/// Payout destination. The engine only checks that one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bank_name: String,
    pub account_holder: String,
    pub iban: String,
    pub swift: Option<String>,
    pub is_default: bool,
}

/// Referral overview for one referrer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferralStats {
    pub referrer_id: Uuid,
    pub referred_users: usize,
    pub qualifying_referrals: usize,
    pub threshold: usize,
    pub threshold_reached: bool,
    pub active_commissions: usize,
    pub current_month_cents: i64,
    pub last_month_cents: i64,
    pub has_bank_account: bool,
}

impl ReferralStats {
    pub fn payout_eligible(&self) -> bool {
        self.has_bank_account && self.active_commissions > 0
    }
}

#[derive(Clone)]
pub struct CommissionService {
    store: Arc<dyn BillingStore>,
    config: CommissionConfig,
    event_logger: BillingEventLogger,
    referrer_locks: KeyedLocks,
}

impl CommissionService {
    pub fn new(store: Arc<dyn BillingStore>, config: CommissionConfig) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            store,
            config,
            event_logger,
            referrer_locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &CommissionConfig {
        &self.config
    }

    /// The user's referral code, generated on first request
    pub async fn referral_code(&self, user_id: Uuid) -> BillingResult<String> {
        if let Some(code) = self.store.get_referral_code(user_id).await? {
            return Ok(code);
        }

        for _ in 0..REFERRAL_CODE_ATTEMPTS {
            let candidate = new_referral_code();
            if self.store.insert_referral_code(user_id, &candidate).await? {
                tracing::info!(user_id = %user_id, code = %candidate, "Referral code generated");
                return Ok(candidate);
            }
            // Lost to a concurrent call for the same user, or the code is taken
            if let Some(code) = self.store.get_referral_code(user_id).await? {
                return Ok(code);
            }
        }

        Err(BillingError::Internal(format!(
            "No free referral code found for {} after {} attempts",
            user_id, REFERRAL_CODE_ATTEMPTS
        )))
    }

    /// Link a new user to the owner of `code`. Returns the referrer.
    ///
    /// Only users without any subscription yet can be referred, and a
    /// referrer is never replaced.
    pub async fn register_referral(&self, referred_id: Uuid, code: &str) -> BillingResult<Uuid> {
        let code = code.trim().to_uppercase();
        let referrer_id = self
            .store
            .find_user_by_referral_code(&code)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("Unknown referral code '{}'", code))
            })?;

        if referrer_id == referred_id {
            return Err(BillingError::InvalidInput("Users cannot refer themselves".into()));
        }
        if !self
            .store
            .list_subscriptions_by_user(referred_id)
            .await?
            .is_empty()
        {
            return Err(BillingError::InvalidInput(
                "Referrals must be registered before the first subscription".into(),
            ));
        }
        if !self.store.set_referrer(referred_id, referrer_id).await? {
            return Err(BillingError::InvalidInput("User already has a referrer".into()));
        }

        tracing::info!(
            referrer_id = %referrer_id,
            referred_id = %referred_id,
            "Referral registered"
        );
        self.event_logger
            .log_or_warn(
                BillingEventBuilder::new(referrer_id, BillingEventType::ReferralRegistered)
                    .data(serde_json::json!({
                        "referred_id": referred_id,
                        "code": code,
                    })),
            )
            .await;

        Ok(referrer_id)
    }

    /// Referred users whose subscription has ever been active, with their
    /// current active subscription if they have one
    async fn qualifying_referrals(
        &self,
        referrer_id: Uuid,
    ) -> BillingResult<Vec<(Uuid, Option<Subscription>)>> {
        let mut qualifying = Vec::new();
        for referred_id in self.store.list_referred_users(referrer_id).await? {
            let subscriptions = self.store.list_subscriptions_by_user(referred_id).await?;
            if subscriptions.iter().any(|s| s.activated_at.is_some()) {
                let active = subscriptions
                    .into_iter()
                    .find(|s| s.status == SubscriptionStatus::Active);
                qualifying.push((referred_id, active));
            }
        }
        Ok(qualifying)
    }

    /// Called after `subscription` became active. Returns the commissions
    /// created by this call.
    pub async fn on_subscription_activated(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Vec<Commission>> {
        let Some(referrer_id) = self.store.referrer_of(subscription.user_id).await? else {
            return Ok(Vec::new());
        };

        let _guard = self.referrer_locks.lock(referrer_id.to_string()).await;
        let qualifying = self.qualifying_referrals(referrer_id).await?;

        if qualifying.len() < self.config.qualifying_threshold {
            tracing::info!(
                referrer_id = %referrer_id,
                qualifying = qualifying.len(),
                threshold = self.config.qualifying_threshold,
                "Referrer below commission threshold"
            );
            return Ok(Vec::new());
        }

        let now = OffsetDateTime::now_utc();
        let mut created = Vec::new();
        for (referred_id, active) in qualifying {
            let Some(active) = active else {
                continue;
            };
            if self
                .store
                .get_commission_by_subscription(active.id)
                .await?
                .is_some()
            {
                continue;
            }

            let commission = self
                .store
                .upsert_commission(&Commission {
                    id: Uuid::new_v4(),
                    referrer_id,
                    referred_id,
                    subscription_id: active.id,
                    monthly_amount_cents: self.config.monthly_amount_cents,
                    status: CommissionStatus::Active,
                    start_date: active.activated_at.unwrap_or(now),
                    end_date: None,
                    last_paid_period: None,
                    created_at: now,
                })
                .await?;

            tracing::info!(
                referrer_id = %referrer_id,
                referred_id = %referred_id,
                subscription_id = %active.id,
                start_date = %commission.start_date,
                "Commission activated"
            );
            self.event_logger
                .log_or_warn(
                    BillingEventBuilder::new(referrer_id, BillingEventType::CommissionActivated)
                        .subscription(active.id)
                        .data(serde_json::json!({
                            "commission_id": commission.id,
                            "referred_id": referred_id,
                            "monthly_amount_cents": commission.monthly_amount_cents,
                        })),
                )
                .await;
            created.push(commission);
        }

        Ok(created)
    }

    async fn end_commission(
        &self,
        mut commission: Commission,
        at: OffsetDateTime,
        reason: &str,
    ) -> BillingResult<Commission> {
        commission.status = CommissionStatus::Inactive;
        commission.end_date = Some(at);
        let commission = self.store.upsert_commission(&commission).await?;

        tracing::info!(
            commission_id = %commission.id,
            referrer_id = %commission.referrer_id,
            referred_id = %commission.referred_id,
            reason = reason,
            "Commission ended"
        );
        self.event_logger
            .log_or_warn(
                BillingEventBuilder::new(commission.referrer_id, BillingEventType::CommissionEnded)
                    .subscription(commission.subscription_id)
                    .data(serde_json::json!({
                        "commission_id": commission.id,
                        "reason": reason,
                    })),
            )
            .await;
        Ok(commission)
    }

    /// End the commission tied to a canceled subscription
    pub async fn on_subscription_canceled(
        &self,
        subscription: &Subscription,
        at: OffsetDateTime,
    ) -> BillingResult<Option<Commission>> {
        match self.store.get_commission_by_subscription(subscription.id).await? {
            Some(c) if c.status == CommissionStatus::Active => Ok(Some(
                self.end_commission(c, at, "subscription_canceled").await?,
            )),
            _ => Ok(None),
        }
    }

    /// End every active commission earned through `referred_id`, e.g. when
    /// the referral link is removed
    pub async fn end_for_referred_user(
        &self,
        referred_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<Vec<Commission>> {
        let mut ended = Vec::new();
        for commission in self.store.list_commissions_by_referred(referred_id).await? {
            if commission.status == CommissionStatus::Active {
                ended.push(self.end_commission(commission, at, "referral_removed").await?);
            }
        }
        Ok(ended)
    }

    /// Active commissions that started before the end of `period` and have
    /// not been paid for it yet
    pub async fn active_unpaid_for_period(
        &self,
        period: BillingPeriod,
    ) -> BillingResult<Vec<Commission>> {
        let period_end = period.end()?;
        Ok(self
            .store
            .list_active_commissions()
            .await?
            .into_iter()
            .filter(|c| c.start_date < period_end)
            .filter(|c| c.last_paid_period.map_or(true, |paid| paid < period))
            .collect())
    }

    /// What a referrer earned during `period`
    pub async fn amount_for_period(
        &self,
        referrer_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<i64> {
        let mut total = 0;
        for commission in self.store.list_commissions_by_referrer(referrer_id).await? {
            if commission.overlaps(&period)? {
                total += commission.monthly_amount_cents;
            }
        }
        Ok(total)
    }

    pub async fn referral_stats(
        &self,
        referrer_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ReferralStats> {
        let referred_users = self.store.list_referred_users(referrer_id).await?.len();
        let qualifying_referrals = self.qualifying_referrals(referrer_id).await?.len();
        let active_commissions = self
            .store
            .list_commissions_by_referrer(referrer_id)
            .await?
            .iter()
            .filter(|c| c.status == CommissionStatus::Active)
            .count();

        let current = BillingPeriod::containing(now);
        Ok(ReferralStats {
            referrer_id,
            referred_users,
            qualifying_referrals,
            threshold: self.config.qualifying_threshold,
            threshold_reached: qualifying_referrals >= self.config.qualifying_threshold,
            active_commissions,
            current_month_cents: self.amount_for_period(referrer_id, current).await?,
            last_month_cents: self
                .amount_for_period(referrer_id, current.previous())
                .await?,
            has_bank_account: self.store.has_bank_account(referrer_id).await?,
        })
    }
}
