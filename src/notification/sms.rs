use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::SmsConfig;

// ── Number Formatting ─────────────────────────────────────────

/// Normalise a national mobile number to E.164 (`+91XXXXXXXXXX`).
///
/// Accepts 10 digits, or 12 digits already carrying the `91` country code.
/// Non-digit characters are ignored. Returns `None` for anything else.
pub fn format_indian(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 {
        return Some(format!("+91{}", digits));
    }
    if digits.len() == 12 && digits.starts_with("91") {
        return Some(format!("+{}", digits));
    }
    None
}

// ── Providers ─────────────────────────────────────────────────

/// What the provider reported for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub provider_id: Option<String>,
    pub details: String,
}

#[async_trait]
pub trait SmsProvider: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<ProviderReceipt>;
}

const TWILIO_API_BASE: &str = "https://api.twilio.com";

/// Twilio-style Messages API over HTTPS with basic auth.
pub struct TwilioProvider {
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    from: String,
}

impl TwilioProvider {
    pub fn new(account_sid: &str, auth_token: &str, from: &str) -> Result<Self> {
        Self::with_base_url(TWILIO_API_BASE, account_sid, auth_token, from)
    }

    pub fn with_base_url(base_url: &str, account_sid: &str, auth_token: &str, from: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("SmartQueue-SMS/1.0")
            .build()
            .context("failed to build SMS HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
            from: from.to_string(),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        )
    }

    /// A sender id starting with `MG` is a messaging service, not a number.
    fn sender_field(&self) -> &'static str {
        if self.from.to_ascii_uppercase().starts_with("MG") {
            "MessagingServiceSid"
        } else {
            "From"
        }
    }
}

#[async_trait]
impl SmsProvider for TwilioProvider {
    async fn send(&self, to: &str, body: &str) -> Result<ProviderReceipt> {
        let form = [
            (self.sender_field(), self.from.as_str()),
            ("To", to),
            ("Body", body),
        ];

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .context("SMS provider request failed")?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = %status, "SMS provider rejected message");
            anyhow::bail!("HTTP {}: {}", status.as_u16(), text);
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .context("SMS provider returned invalid JSON")?;
        let provider_id = payload
            .get("sid")
            .or_else(|| payload.get("message_sid"))
            .and_then(|v| v.as_str())
            .map(String::from);

        info!(provider_id = ?provider_id, "SMS accepted by provider");
        Ok(ProviderReceipt {
            provider_id,
            details: payload.to_string(),
        })
    }
}

/// Accepts every message without sending it. For local and dev use.
pub struct SimulatedProvider;

#[async_trait]
impl SmsProvider for SimulatedProvider {
    async fn send(&self, to: &str, _body: &str) -> Result<ProviderReceipt> {
        info!(to, "simulated SMS send");
        Ok(ProviderReceipt {
            provider_id: Some("SIMULATED".to_string()),
            details: "Simulated send: provider credentials not configured".to_string(),
        })
    }
}

/// Stand-in used when no credentials are configured; every send fails.
pub struct UnconfiguredProvider;

#[async_trait]
impl SmsProvider for UnconfiguredProvider {
    async fn send(&self, _to: &str, _body: &str) -> Result<ProviderReceipt> {
        anyhow::bail!("missing SMS provider credentials")
    }
}

/// Pick a provider: real credentials first, then simulation if enabled.
pub fn provider_from_config(cfg: &SmsConfig) -> Result<Arc<dyn SmsProvider>> {
    if let Some((sid, token, from)) = cfg.credentials() {
        return Ok(Arc::new(TwilioProvider::new(sid, token, from)?));
    }
    if cfg.simulate {
        return Ok(Arc::new(SimulatedProvider));
    }
    warn!("SMS provider credentials not configured; notifications will be logged as failed");
    Ok(Arc::new(UnconfiguredProvider))
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_format_ten_digits() {
        assert_eq!(format_indian("9876543210").as_deref(), Some("+919876543210"));
        assert_eq!(format_indian("98765 43210").as_deref(), Some("+919876543210"));
    }

    #[test]
    fn test_format_with_country_code() {
        assert_eq!(format_indian("+91 98765-43210").as_deref(), Some("+919876543210"));
        assert_eq!(format_indian("919876543210").as_deref(), Some("+919876543210"));
    }

    #[test]
    fn test_format_rejects_bad_numbers() {
        assert!(format_indian("").is_none());
        assert!(format_indian("12345").is_none());
        assert!(format_indian("449876543210").is_none());
    }

    #[test]
    fn test_messaging_service_sender_field() {
        let p = TwilioProvider::new("AC1", "tok", "MG123").unwrap();
        assert_eq!(p.sender_field(), "MessagingServiceSid");
        let p = TwilioProvider::new("AC1", "tok", "+15005550006").unwrap();
        assert_eq!(p.sender_field(), "From");
    }

    #[test]
    fn test_provider_selection() {
        let simulated = SmsConfig {
            simulate: true,
            ..Default::default()
        };
        let p = provider_from_config(&simulated).unwrap();
        let receipt = tokio_test::block_on(p.send("+919876543210", "hi")).unwrap();
        assert_eq!(receipt.provider_id.as_deref(), Some("SIMULATED"));

        let none = SmsConfig::default();
        let p = provider_from_config(&none).unwrap();
        assert!(tokio_test::block_on(p.send("+919876543210", "hi")).is_err());
    }

    #[tokio::test]
    async fn test_twilio_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC1/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("Body=Your+token"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sid": "SM42",
                "status": "queued"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let p = TwilioProvider::with_base_url(&server.uri(), "AC1", "tok", "+15005550006").unwrap();
        let receipt = p.send("+919876543210", "Your token #4 is next").await.unwrap();
        assert_eq!(receipt.provider_id.as_deref(), Some("SM42"));
    }

    #[tokio::test]
    async fn test_twilio_http_error_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid To number"))
            .mount(&server)
            .await;

        let p = TwilioProvider::with_base_url(&server.uri(), "AC1", "tok", "+15005550006").unwrap();
        let err = p.send("+919876543210", "hello").await.unwrap_err();
        assert!(err.to_string().contains("HTTP 400"));
    }
}
