//! PayPal Orders v2 adapter
//!
//! Initiation creates an order with intent `CAPTURE` and returns the buyer
//! approval link. Confirmation captures the approved order. The capture is
//! sent with `PayPal-Request-Id` set to the order id, so a retried capture
//! is answered idempotently by PayPal; an order that was already captured
//! is read back instead of failing.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    decimal_to_minor, minor_to_decimal, Confirmation, InitiatedPayment, PaymentMethod,
    PaymentProvider, ProviderDelivery, WebhookEvent,
};
use crate::config::PayPalConfig;
use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;

pub const EVENT_ORDER_APPROVED: &str = "CHECKOUT.ORDER.APPROVED";
pub const EVENT_CAPTURE_COMPLETED: &str = "PAYMENT.CAPTURE.COMPLETED";
pub const EVENT_CAPTURE_DENIED: &str = "PAYMENT.CAPTURE.DENIED";

/// Refresh the access token this long before PayPal says it expires
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct OrderCreated {
    id: String,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Amount {
    currency_code: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
    amount: Option<Amount>,
}

#[derive(Debug, Default, Deserialize)]
struct Payments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<Payments>,
}

#[derive(Debug, Deserialize)]
struct Payer {
    payer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Order {
    id: String,
    status: String,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
    payer: Option<Payer>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    issue: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    name: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

impl ErrorBody {
    fn issue(&self) -> String {
        self.details
            .iter()
            .find_map(|d| d.issue.clone())
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }
}

/// Transmission headers PayPal attaches to every webhook delivery
#[derive(Debug, Clone, Serialize)]
pub struct PayPalSignatureHeaders {
    pub auth_algo: String,
    pub cert_url: String,
    pub transmission_id: String,
    pub transmission_sig: String,
    pub transmission_time: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    verification_status: String,
}

pub struct PayPalProvider {
    http: reqwest::Client,
    config: PayPalConfig,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalProvider {
    pub fn new(config: PayPalConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("PayPal HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> BillingResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let resp = self
            .http
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            tracing::error!(status = %status, "PayPal token request failed");
            return Err(BillingError::ProviderUnavailable(format!(
                "paypal: token request returned {}",
                status
            )));
        }

        let token: TokenResponse = resp.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    async fn create_order(&self, user_id: Uuid, plan: &Plan) -> BillingResult<OrderCreated> {
        let token = self.access_token().await?;
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": plan.id.to_string(),
                "custom_id": user_id.to_string(),
                "description": plan.name,
                "amount": {
                    "currency_code": plan.currency.to_uppercase(),
                    "value": minor_to_decimal(plan.price_cents),
                },
            }],
            "application_context": {
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
                "brand_name": self.config.brand_name,
                "landing_page": "BILLING",
                "user_action": "PAY_NOW",
                "shipping_preference": "NO_SHIPPING",
            },
        });

        let resp = self
            .http
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let err: ErrorBody = resp.json().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                issue = %err.issue(),
                plan_id = %plan.id,
                "PayPal order creation failed"
            );
            return Err(BillingError::ProviderUnavailable(format!(
                "paypal: order creation returned {} ({})",
                status,
                err.issue()
            )));
        }

        Ok(resp.json().await?)
    }

    async fn get_order(&self, token: &str, order_id: &str) -> BillingResult<Order> {
        let resp = self
            .http
            .get(self.url(&format!("/v2/checkout/orders/{}", order_id)))
            .bearer_auth(token)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BillingError::ProviderUnavailable(format!(
                "paypal: order lookup returned {}",
                status
            )));
        }

        Ok(resp.json().await?)
    }

    /// Authenticate a webhook delivery through PayPal's verification API
    /// and parse it.
    pub async fn verify_event(
        &self,
        headers: &PayPalSignatureHeaders,
        payload: &str,
    ) -> BillingResult<WebhookEvent> {
        let webhook_id = self.config.webhook_id.as_deref().ok_or_else(|| {
            BillingError::Config("PAYPAL_WEBHOOK_ID is required to verify webhooks".to_string())
        })?;
        let event: Value = serde_json::from_str(payload)?;

        let token = self.access_token().await?;
        let resp = self
            .http
            .post(self.url("/v1/notifications/verify-webhook-signature"))
            .bearer_auth(&token)
            .json(&json!({
                "auth_algo": headers.auth_algo,
                "cert_url": headers.cert_url,
                "transmission_id": headers.transmission_id,
                "transmission_sig": headers.transmission_sig,
                "transmission_time": headers.transmission_time,
                "webhook_id": webhook_id,
                "webhook_event": event,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BillingError::ProviderUnavailable(format!(
                "paypal: webhook verification returned {}",
                status
            )));
        }

        let verdict: VerifyResponse = resp.json().await?;
        if verdict.verification_status != "SUCCESS" {
            tracing::warn!(
                transmission_id = %headers.transmission_id,
                verification_status = %verdict.verification_status,
                "PayPal webhook signature rejected"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        parse_event(event)
    }
}

/// Turn a raw PayPal webhook body into a [`WebhookEvent`]
pub fn parse_event(event: Value) -> BillingResult<WebhookEvent> {
    let event_type = event
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::InvalidInput("PayPal event without event_type".into()))?
        .to_string();

    Ok(WebhookEvent {
        provider: PaymentMethod::PayPal,
        event_id: event.get("id").and_then(Value::as_str).map(str::to_string),
        event_type,
        provider_object: event.get("resource").cloned().unwrap_or(Value::Null),
    })
}

/// Read the completed capture out of an order
fn confirmation_from_order(order: &Order) -> BillingResult<Confirmation> {
    let capture = order
        .purchase_units
        .iter()
        .filter_map(|unit| unit.payments.as_ref())
        .flat_map(|payments| payments.captures.iter())
        .next();

    let Some(capture) = capture else {
        return Ok(Confirmation::rejected(format!(
            "order {} has no capture (status {})",
            order.id, order.status
        )));
    };

    if capture.status != "COMPLETED" {
        return Ok(Confirmation::rejected(format!(
            "capture {} is {}",
            capture.id, capture.status
        )));
    }

    let amount = capture.amount.as_ref().ok_or_else(|| {
        BillingError::InvalidInput(format!("capture {} has no amount", capture.id))
    })?;

    Ok(
        Confirmation::captured(&capture.id, decimal_to_minor(&amount.value)?, &amount.currency_code)
            .with_customer(order.payer.as_ref().and_then(|p| p.payer_id.clone())),
    )
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::PayPal
    }

    async fn initiate(&self, user_id: Uuid, plan: &Plan) -> BillingResult<InitiatedPayment> {
        let order = self.create_order(user_id, plan).await?;

        let approve = order
            .links
            .iter()
            .find(|link| link.rel == "approve")
            .map(|link| link.href.clone())
            .ok_or_else(|| {
                BillingError::ProviderUnavailable(format!(
                    "paypal: order {} has no approve link",
                    order.id
                ))
            })?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan.id,
            order_id = %order.id,
            "PayPal order created"
        );

        Ok(InitiatedPayment {
            redirect_url: approve,
            correlation_id: order.id,
        })
    }

    async fn confirm(&self, correlation_id: &str) -> BillingResult<Confirmation> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .post(self.url(&format!("/v2/checkout/orders/{}/capture", correlation_id)))
            .bearer_auth(&token)
            .header("PayPal-Request-Id", correlation_id)
            .header("Content-Type", "application/json")
            .body("{}")
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            let order: Order = resp.json().await?;
            let confirmation = confirmation_from_order(&order)?;
            tracing::info!(
                order_id = %correlation_id,
                captured = confirmation.is_captured(),
                "PayPal capture finished"
            );
            return Ok(confirmation);
        }

        if status.is_server_error()
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            tracing::error!(order_id = %correlation_id, status = %status, "PayPal capture failed");
            return Err(BillingError::ProviderUnavailable(format!(
                "paypal: capture returned {}",
                status
            )));
        }

        let err: ErrorBody = resp.json().await.unwrap_or_default();
        let issue = err.issue();
        if issue == "ORDER_ALREADY_CAPTURED" {
            tracing::info!(order_id = %correlation_id, "Order already captured, reading it back");
            let order = self.get_order(&token, correlation_id).await?;
            return confirmation_from_order(&order);
        }

        tracing::warn!(
            order_id = %correlation_id,
            status = %status,
            issue = %issue,
            "PayPal declined capture"
        );
        Ok(Confirmation::rejected(issue))
    }

    fn interpret_event(&self, event: &WebhookEvent) -> BillingResult<Option<ProviderDelivery>> {
        let resource = &event.provider_object;

        match event.event_type.as_str() {
            EVENT_ORDER_APPROVED => {
                let order_id = str_at(resource, "/id").ok_or_else(|| {
                    BillingError::InvalidInput("approved order without id".into())
                })?;
                Ok(Some(ProviderDelivery {
                    correlation_id: order_id.to_string(),
                    confirmation: None,
                }))
            }
            EVENT_CAPTURE_COMPLETED | EVENT_CAPTURE_DENIED => {
                let order_id = str_at(resource, "/supplementary_data/related_ids/order_id")
                    .ok_or_else(|| {
                        BillingError::InvalidInput(format!(
                            "{} without related order id",
                            event.event_type
                        ))
                    })?;

                let confirmation = if event.event_type == EVENT_CAPTURE_COMPLETED {
                    let capture_id = str_at(resource, "/id").ok_or_else(|| {
                        BillingError::InvalidInput("capture without id".into())
                    })?;
                    let value = str_at(resource, "/amount/value").ok_or_else(|| {
                        BillingError::InvalidInput("capture without amount".into())
                    })?;
                    let currency = str_at(resource, "/amount/currency_code").unwrap_or_default();
                    Confirmation::captured(capture_id, decimal_to_minor(value)?, currency)
                } else {
                    let reason = str_at(resource, "/status_details/reason").unwrap_or("DENIED");
                    Confirmation::rejected(reason)
                };

                Ok(Some(ProviderDelivery {
                    correlation_id: order_id.to_string(),
                    confirmation: Some(confirmation),
                }))
            }
            _ => Ok(None),
        }
    }
}
