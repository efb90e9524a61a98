//! Engine configuration
//!
//! Binaries build these from the environment once at startup and pass them
//! into the adapters. Nothing in the engine reads process-wide configuration
//! at call time.

use std::time::Duration;

use praxis_shared::{env_opt, env_or, env_parse};

use crate::error::{BillingError, BillingResult};

const PAYPAL_SANDBOX_API: &str = "https://api-m.sandbox.paypal.com";
const PAYPAL_LIVE_API: &str = "https://api-m.paypal.com";

/// Complete billing configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// `None` when Stripe is not configured
    pub stripe: Option<StripeConfig>,
    /// `None` when PayPal is not configured
    pub paypal: Option<PayPalConfig>,
    pub commission: CommissionConfig,
    /// How long a checkout may stay `pending` before it is expired
    pub pending_checkout_ttl: time::Duration,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let timeout = Duration::from_secs(env_parse("PROVIDER_HTTP_TIMEOUT_SECS", 30u64)?);
        let ttl_days: i64 = env_parse("PENDING_CHECKOUT_TTL_DAYS", 7i64)?;
        if ttl_days <= 0 {
            return Err(BillingError::Config(
                "PENDING_CHECKOUT_TTL_DAYS must be positive".to_string(),
            ));
        }

        let config = Self {
            stripe: StripeConfig::from_env()?,
            paypal: PayPalConfig::from_env(timeout)?,
            commission: CommissionConfig::from_env()?,
            pending_checkout_ttl: time::Duration::days(ttl_days),
        };

        if config.stripe.is_none() && config.paypal.is_none() {
            tracing::warn!("No payment provider configured - checkouts will be refused");
        }

        Ok(config)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            stripe: None,
            paypal: None,
            commission: CommissionConfig::default(),
            pending_checkout_ttl: time::Duration::days(7),
        }
    }
}

/// Stripe Checkout configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Endpoint signing secret (`whsec_...`)
    pub webhook_secret: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &redact(&self.secret_key))
            .field("webhook_secret", &self.webhook_secret.as_deref().map(redact))
            .field("success_url", &self.success_url)
            .field("cancel_url", &self.cancel_url)
            .finish()
    }
}

impl StripeConfig {
    /// `Ok(None)` when `STRIPE_SECRET_KEY` is not set
    pub fn from_env() -> BillingResult<Option<Self>> {
        let Some(secret_key) = env_opt("STRIPE_SECRET_KEY") else {
            return Ok(None);
        };

        let config = Self {
            secret_key,
            webhook_secret: env_opt("STRIPE_WEBHOOK_SECRET"),
            success_url: required("STRIPE_SUCCESS_URL")?,
            cancel_url: required("STRIPE_CANCEL_URL")?,
        };

        tracing::info!(
            live = config.is_live(),
            webhook_verification = config.webhook_secret.is_some(),
            "Stripe configuration loaded"
        );
        Ok(Some(config))
    }

    pub fn is_live(&self) -> bool {
        self.secret_key.starts_with("sk_live_")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayPalMode {
    Sandbox,
    Live,
}

impl std::str::FromStr for PayPalMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sandbox" => Ok(PayPalMode::Sandbox),
            "live" | "production" => Ok(PayPalMode::Live),
            other => Err(BillingError::Config(format!(
                "PAYPAL_MODE must be 'sandbox' or 'live', got '{}'",
                other
            ))),
        }
    }
}

/// PayPal Orders API configuration
#[derive(Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub mode: PayPalMode,
    pub api_base: String,
    pub return_url: String,
    pub cancel_url: String,
    pub brand_name: String,
    /// Webhook id used for signature verification
    pub webhook_id: Option<String>,
    pub http_timeout: Duration,
}

impl std::fmt::Debug for PayPalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayPalConfig")
            .field("client_id", &redact(&self.client_id))
            .field("mode", &self.mode)
            .field("api_base", &self.api_base)
            .field("return_url", &self.return_url)
            .field("cancel_url", &self.cancel_url)
            .field("brand_name", &self.brand_name)
            .field("webhook_id", &self.webhook_id)
            .finish()
    }
}

impl PayPalConfig {
    /// `Ok(None)` unless both client id and secret are set
    pub fn from_env(http_timeout: Duration) -> BillingResult<Option<Self>> {
        let (Some(client_id), Some(client_secret)) = (
            env_opt("PAYPAL_CLIENT_ID"),
            env_opt("PAYPAL_CLIENT_SECRET"),
        ) else {
            return Ok(None);
        };

        let mode: PayPalMode = env_or("PAYPAL_MODE", "sandbox").parse()?;
        let api_base = env_opt("PAYPAL_API_BASE").unwrap_or_else(|| {
            match mode {
                PayPalMode::Sandbox => PAYPAL_SANDBOX_API,
                PayPalMode::Live => PAYPAL_LIVE_API,
            }
            .to_string()
        });

        let config = Self {
            client_id,
            client_secret,
            mode,
            api_base,
            return_url: required("PAYPAL_RETURN_URL")?,
            cancel_url: required("PAYPAL_CANCEL_URL")?,
            brand_name: env_or("PAYPAL_BRAND_NAME", "Praxis"),
            webhook_id: env_opt("PAYPAL_WEBHOOK_ID"),
            http_timeout,
        };

        tracing::info!(
            mode = ?config.mode,
            api_base = %config.api_base,
            "PayPal configuration loaded"
        );
        Ok(Some(config))
    }
}

/// Referral commission rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionConfig {
    /// Qualifying referrals needed before any commission accrues
    pub qualifying_threshold: usize,
    /// Fixed amount per qualifying referral per month, minor units
    pub monthly_amount_cents: i64,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            qualifying_threshold: 3,
            monthly_amount_cents: 100,
        }
    }
}

impl CommissionConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let config = Self {
            qualifying_threshold: env_parse("COMMISSION_THRESHOLD", defaults.qualifying_threshold)?,
            monthly_amount_cents: env_parse(
                "COMMISSION_MONTHLY_CENTS",
                defaults.monthly_amount_cents,
            )?,
        };
        if config.qualifying_threshold == 0 || config.monthly_amount_cents <= 0 {
            return Err(BillingError::Config(
                "COMMISSION_THRESHOLD and COMMISSION_MONTHLY_CENTS must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

fn required(name: &str) -> BillingResult<String> {
    env_opt(name).ok_or_else(|| BillingError::Config(format!("{} must be set", name)))
}

/// Keep a short prefix of a secret for log correlation
fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(8).collect();
    format!("{}... ({} chars)", prefix, secret.chars().count())
}
