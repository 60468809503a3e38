//! Payment gateway adapter.
//!
//! Normalizes provider webhook payloads into a provider-agnostic
//! [`GatewayEvent`] (a closed tagged union dispatched exhaustively by
//! the webhook processor), verifies webhook signatures, and exposes
//! the lookup calls used by fallback reconciliation.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{LedgerError, LedgerResult};

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the gateway's signature timestamp and
/// our own, in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Gateway credentials and endpoints, loaded from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
}

impl GatewayConfig {
    pub fn from_env() -> LedgerResult<Self> {
        let secret_key = std::env::var("GATEWAY_SECRET_KEY")
            .map_err(|_| LedgerError::GatewayConfig("GATEWAY_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("GATEWAY_WEBHOOK_SECRET")
            .map_err(|_| LedgerError::GatewayConfig("GATEWAY_WEBHOOK_SECRET not set".to_string()))?;
        let api_base = std::env::var("GATEWAY_API_BASE")
            .unwrap_or_else(|_| "https://api.paygate.example/v1".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base,
        })
    }
}

/// Checkout session payload (credit purchases and plan signups).
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub amount_total: Option<Decimal>,
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Payment intent payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Invoice payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub payment_intent: Option<String>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub amount_paid: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub amount_due: Option<Decimal>,
    pub currency: Option<String>,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
}

/// Subscription payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: Option<String>,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    /// Plan tier as carried in the gateway metadata, set at checkout.
    pub fn plan_tier(&self) -> Option<&str> {
        self.metadata.get("plan_tier").map(|s| s.as_str())
    }
}

/// Charge payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    pub payment_intent: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub amount_refunded: Option<Decimal>,
    pub currency: Option<String>,
}

/// Dispute payload.
#[derive(Debug, Clone, Deserialize)]
pub struct DisputeObject {
    pub id: String,
    pub charge: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub reason: Option<String>,
}

/// Refund payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundObject {
    pub id: String,
    pub charge: String,
    pub payment_intent: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: Option<String>,
}

/// Customer record returned by the gateway lookup API.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerObject {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Provider-agnostic webhook event.
///
/// A closed union: every event type the processor handles is a
/// variant, so an unhandled type is a visible gap at the match site
/// rather than a silently ignored string.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    CheckoutCompleted(CheckoutSessionObject),
    PaymentSucceeded(PaymentIntentObject),
    InvoicePaymentPaid(InvoiceObject),
    PaymentFailed(PaymentIntentObject),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    ChargeSucceeded(ChargeObject),
    ChargeDisputed(DisputeObject),
    RefundCreated(RefundObject),
    Unhandled { event_type: String },
}

impl GatewayEvent {
    pub fn type_name(&self) -> &str {
        match self {
            GatewayEvent::CheckoutCompleted(_) => "checkout.session.completed",
            GatewayEvent::PaymentSucceeded(_) => "payment_intent.succeeded",
            GatewayEvent::InvoicePaymentPaid(_) => "invoice.payment_succeeded",
            GatewayEvent::PaymentFailed(_) => "payment_intent.payment_failed",
            GatewayEvent::SubscriptionCreated(_) => "customer.subscription.created",
            GatewayEvent::SubscriptionUpdated(_) => "customer.subscription.updated",
            GatewayEvent::SubscriptionDeleted(_) => "customer.subscription.deleted",
            GatewayEvent::ChargeSucceeded(_) => "charge.succeeded",
            GatewayEvent::ChargeDisputed(_) => "charge.dispute.created",
            GatewayEvent::RefundCreated(_) => "refund.created",
            GatewayEvent::Unhandled { event_type } => event_type,
        }
    }
}

/// A verified, normalized webhook delivery.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    /// The gateway's event id, unique per delivery attempt group.
    pub event_id: String,
    /// Unix timestamp the gateway created the event.
    pub created: i64,
    pub event: GatewayEvent,
}

/// Raw webhook envelope as delivered by the gateway.
#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

/// Client for signature verification and fallback lookups.
#[derive(Clone)]
pub struct GatewayClient {
    config: GatewayConfig,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> LedgerResult<Self> {
        Ok(Self::new(GatewayConfig::from_env()?))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Verify the webhook signature and normalize the payload.
    ///
    /// The signature header has the form `t=<unix>,v1=<hex hmac>`;
    /// the HMAC-SHA256 is computed over `"<t>.<payload>"` with the
    /// webhook secret. Any parse or mismatch is `SignatureInvalid`.
    pub fn verify_webhook(&self, payload: &str, signature: &str) -> LedgerResult<NormalizedEvent> {
        self.verify_webhook_at(payload, signature, unix_now())
    }

    /// Verification with an injectable clock, for tests.
    fn verify_webhook_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> LedgerResult<NormalizedEvent> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            LedgerError::SignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            LedgerError::SignatureInvalid
        })?;

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(LedgerError::SignatureInvalid);
        }

        let secret = self
            .config
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.config.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            LedgerError::SignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(LedgerError::SignatureInvalid);
        }

        normalize(payload)
    }

    /// Fetch an invoice from the gateway, for fallback reconciliation.
    pub async fn retrieve_invoice(&self, invoice_id: &str) -> LedgerResult<InvoiceObject> {
        self.get_json(&format!("invoices/{}", invoice_id)).await
    }

    /// Fetch a customer from the gateway, for the email fallback.
    pub async fn retrieve_customer(&self, customer_id: &str) -> LedgerResult<CustomerObject> {
        self.get_json(&format!("customers/{}", customer_id)).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> LedgerResult<T> {
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| LedgerError::Gateway(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::Gateway(format!(
                "GET {} returned {}",
                path,
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| LedgerError::Gateway(format!("decode {}: {}", path, e)))
    }
}

/// Parse a raw webhook body into a normalized event.
pub fn normalize(payload: &str) -> LedgerResult<NormalizedEvent> {
    let envelope: WebhookEnvelope = serde_json::from_str(payload).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to parse webhook envelope");
        LedgerError::SignatureInvalid
    })?;

    let object = envelope.data.object;
    let event = match envelope.event_type.as_str() {
        "checkout.session.completed" => GatewayEvent::CheckoutCompleted(decode(object)?),
        "payment_intent.succeeded" => GatewayEvent::PaymentSucceeded(decode(object)?),
        "invoice.payment_succeeded" | "invoice.paid" => {
            GatewayEvent::InvoicePaymentPaid(decode(object)?)
        }
        "payment_intent.payment_failed" => GatewayEvent::PaymentFailed(decode(object)?),
        "customer.subscription.created" => GatewayEvent::SubscriptionCreated(decode(object)?),
        "customer.subscription.updated" => GatewayEvent::SubscriptionUpdated(decode(object)?),
        "customer.subscription.deleted" => GatewayEvent::SubscriptionDeleted(decode(object)?),
        "charge.succeeded" => GatewayEvent::ChargeSucceeded(decode(object)?),
        "charge.dispute.created" => GatewayEvent::ChargeDisputed(decode(object)?),
        "refund.created" => GatewayEvent::RefundCreated(decode(object)?),
        other => GatewayEvent::Unhandled {
            event_type: other.to_string(),
        },
    };

    Ok(NormalizedEvent {
        event_id: envelope.id,
        created: envelope.created,
        event,
    })
}

fn decode<T: serde::de::DeserializeOwned>(object: serde_json::Value) -> LedgerResult<T> {
    serde_json::from_value(object).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to decode webhook payload object");
        LedgerError::Gateway(format!("malformed event payload: {}", e))
    })
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn client() -> GatewayClient {
        GatewayClient::new(GatewayConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_testsecret".to_string(),
            api_base: "https://api.paygate.example/v1".to_string(),
        })
    }

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let signed = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn payment_intent_payload() -> String {
        serde_json::json!({
            "id": "evt_100",
            "type": "payment_intent.succeeded",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "pi_123",
                "customer": "cus_9",
                "subscription": "sub_5",
                "amount": "49.00",
                "currency": "usd",
                "latest_charge": "ch_77"
            }}
        })
        .to_string()
    }

    #[test]
    fn valid_signature_verifies_and_normalizes() {
        let client = client();
        let payload = payment_intent_payload();
        let now = 1_700_000_000;
        let sig = sign(&payload, "testsecret", now);

        let normalized = client.verify_webhook_at(&payload, &sig, now).unwrap();
        assert_eq!(normalized.event_id, "evt_100");
        match normalized.event {
            GatewayEvent::PaymentSucceeded(pi) => {
                assert_eq!(pi.id, "pi_123");
                assert_eq!(pi.amount, dec!(49.00));
                assert_eq!(pi.subscription.as_deref(), Some("sub_5"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let client = client();
        let payload = payment_intent_payload();
        let now = 1_700_000_000;
        let sig = sign(&payload, "testsecret", now);
        let tampered = payload.replace("49.00", "4900.00");

        let err = client.verify_webhook_at(&tampered, &sig, now).unwrap_err();
        assert!(matches!(err, LedgerError::SignatureInvalid));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let client = client();
        let payload = payment_intent_payload();
        let now = 1_700_000_000;
        let sig = sign(&payload, "othersecret", now);

        let err = client.verify_webhook_at(&payload, &sig, now).unwrap_err();
        assert!(matches!(err, LedgerError::SignatureInvalid));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let client = client();
        let payload = payment_intent_payload();
        let signed_at = 1_700_000_000;
        let sig = sign(&payload, "testsecret", signed_at);

        let err = client
            .verify_webhook_at(&payload, &sig, signed_at + SIGNATURE_TOLERANCE_SECS + 1)
            .unwrap_err();
        assert!(matches!(err, LedgerError::SignatureInvalid));
    }

    #[test]
    fn missing_signature_parts_are_rejected() {
        let client = client();
        let payload = payment_intent_payload();

        assert!(client
            .verify_webhook_at(&payload, "v1=deadbeef", 1_700_000_000)
            .is_err());
        assert!(client
            .verify_webhook_at(&payload, "t=1700000000", 1_700_000_000)
            .is_err());
    }

    #[test]
    fn unknown_event_type_normalizes_to_unhandled() {
        let payload = serde_json::json!({
            "id": "evt_7",
            "type": "customer.tax_id.created",
            "created": 1_700_000_000,
            "data": { "object": {} }
        })
        .to_string();

        let normalized = normalize(&payload).unwrap();
        match normalized.event {
            GatewayEvent::Unhandled { event_type } => {
                assert_eq!(event_type, "customer.tax_id.created");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn subscription_event_carries_plan_tier_metadata() {
        let payload = serde_json::json!({
            "id": "evt_8",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "sub_5",
                "customer": "cus_9",
                "status": "active",
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000,
                "metadata": { "plan_tier": "growth" }
            }}
        })
        .to_string();

        let normalized = normalize(&payload).unwrap();
        match normalized.event {
            GatewayEvent::SubscriptionUpdated(sub) => {
                assert_eq!(sub.plan_tier(), Some("growth"));
                assert_eq!(sub.status, "active");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn invoice_paid_alias_maps_to_same_variant() {
        for event_type in ["invoice.payment_succeeded", "invoice.paid"] {
            let payload = serde_json::json!({
                "id": "evt_9",
                "type": event_type,
                "created": 1_700_000_000,
                "data": { "object": {
                    "id": "in_1",
                    "customer": "cus_9",
                    "subscription": "sub_5",
                    "payment_intent": "pi_123",
                    "amount_paid": "49.00"
                }}
            })
            .to_string();

            let normalized = normalize(&payload).unwrap();
            assert!(matches!(
                normalized.event,
                GatewayEvent::InvoicePaymentPaid(_)
            ));
        }
    }
}
