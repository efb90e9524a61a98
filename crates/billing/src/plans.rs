//! Plan catalog
//!
//! Plans are read-only to the engine. A plan referenced by subscriptions is
//! never edited in place; deactivate it and create a replacement instead.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_CURRENCY: &str = "EUR";

/// Billing interval of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            BillingInterval::Month => 1,
            BillingInterval::Year => 12,
        }
    }

    /// End of a period starting at `start`, in calendar months.
    pub fn advance(&self, start: OffsetDateTime) -> BillingResult<OffsetDateTime> {
        add_months(start, self.months())
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "month" | "monthly" => Ok(BillingInterval::Month),
            "year" | "yearly" | "annual" => Ok(BillingInterval::Year),
            other => Err(BillingError::InvalidInput(format!(
                "Invalid billing interval '{}'",
                other
            ))),
        }
    }
}

/// Add calendar months, clamping the day to the target month's length
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(at: OffsetDateTime, months: u32) -> BillingResult<OffsetDateTime> {
    let date = at.date();
    let zero_based = date.year() * 12 + (date.month() as i32 - 1) + months as i32;
    let year = zero_based.div_euclid(12);
    let month = Month::try_from((zero_based.rem_euclid(12) + 1) as u8)?;
    let day = date.day().min(time::util::days_in_year_month(year, month));

    Ok(at.replace_date(Date::from_calendar_date(year, month, day)?))
}

/// A purchasable plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Price in minor currency units
    pub price_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub features: Vec<String>,
    pub client_limit: Option<i32>,
    pub is_active: bool,
    pub sort_order: i32,
}

impl Plan {
    /// Human readable price, e.g. `20.00 EUR`
    pub fn display_price(&self) -> String {
        format!(
            "{}.{:02} {}",
            self.price_cents / 100,
            (self.price_cents % 100).abs(),
            self.currency
        )
    }
}

/// Input for creating a plan
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub currency: Option<String>,
    pub interval: BillingInterval,
    #[serde(default)]
    pub features: Vec<String>,
    pub client_limit: Option<i32>,
    #[serde(default)]
    pub sort_order: i32,
}

impl NewPlan {
    pub fn validate(&self) -> BillingResult<()> {
        if self.name.trim().is_empty() {
            return Err(BillingError::InvalidInput("Plan name is required".into()));
        }
        if self.price_cents <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Plan price must be positive, got {}",
                self.price_cents
            )));
        }
        Ok(())
    }

    pub fn into_plan(self, id: Uuid) -> Plan {
        Plan {
            id,
            name: self.name,
            description: self.description,
            price_cents: self.price_cents,
            currency: self
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            interval: self.interval,
            features: self.features,
            client_limit: self.client_limit,
            is_active: true,
            sort_order: self.sort_order,
        }
    }
}

/// Read access to plan definitions
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>>;

    async fn create_plan(&self, plan: NewPlan) -> BillingResult<Plan>;

    async fn set_plan_active(&self, plan_id: Uuid, active: bool) -> BillingResult<()>;

    /// Resolve a plan that can be purchased right now
    async fn get_active_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        match self.get_plan(plan_id).await? {
            Some(plan) if plan.is_active => Ok(plan),
            Some(_) => Err(BillingError::PlanNotFound(format!(
                "Plan {} is no longer offered",
                plan_id
            ))),
            None => Err(BillingError::PlanNotFound(plan_id.to_string())),
        }
    }
}

/// In-memory plan catalog
#[derive(Default)]
pub struct InMemoryPlanCatalog {
    plans: RwLock<HashMap<Uuid, Plan>>,
}

impl InMemoryPlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(plans: Vec<Plan>) -> Self {
        Self {
            plans: RwLock::new(plans.into_iter().map(|p| (p.id, p)).collect()),
        }
    }

    pub fn insert(&self, plan: Plan) {
        self.plans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plan.id, plan);
    }
}

#[async_trait]
impl PlanCatalog for InMemoryPlanCatalog {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self
            .plans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&plan_id)
            .cloned())
    }

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let mut plans: Vec<Plan> = self
            .plans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.name.cmp(&b.name)));
        Ok(plans)
    }

    async fn create_plan(&self, plan: NewPlan) -> BillingResult<Plan> {
        plan.validate()?;
        let plan = plan.into_plan(Uuid::new_v4());
        self.insert(plan.clone());
        Ok(plan)
    }

    async fn set_plan_active(&self, plan_id: Uuid, active: bool) -> BillingResult<()> {
        let mut plans = self.plans.write().unwrap_or_else(|e| e.into_inner());
        let plan = plans
            .get_mut(&plan_id)
            .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))?;
        plan.is_active = active;
        Ok(())
    }
}
