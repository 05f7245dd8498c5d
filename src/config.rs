use serde::Deserialize;

use crate::models::service::DEFAULT_AVG_SERVICE_TIME;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    /// Pool size. Set via SMARTQ_DB_MAX_CONNECTIONS. Default: 10.
    pub db_max_connections: u32,
    /// Minutes per token for services without a usable average.
    /// Set via SMARTQ_DEFAULT_AVG_SERVICE_TIME. Default: 5.
    pub default_avg_service_time: i32,
    pub sms: SmsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmsConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    /// Sender number, or a messaging service id starting with `MG`.
    pub from_number: Option<String>,
    /// Pretend sends succeed when credentials are missing (local/dev).
    pub simulate: bool,
}

impl SmsConfig {
    /// All three provider credentials, if every one of them is set.
    pub fn credentials(&self) -> Option<(&str, &str, &str)> {
        match (&self.account_sid, &self.auth_token, &self.from_number) {
            (Some(sid), Some(token), Some(from)) => Some((sid, token, from)),
            _ => None,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let default_avg_service_time = std::env::var("SMARTQ_DEFAULT_AVG_SERVICE_TIME")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_AVG_SERVICE_TIME);

    Ok(Config {
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/smart_queue".into()),
        db_max_connections: std::env::var("SMARTQ_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
        default_avg_service_time,
        sms: SmsConfig {
            account_sid: non_empty_env("SMS_ACCOUNT_SID"),
            auth_token: non_empty_env("SMS_AUTH_TOKEN"),
            from_number: non_empty_env("SMS_FROM_NUMBER"),
            simulate: parse_flag(&std::env::var("SMS_SIMULATE").unwrap_or_default()),
        },
    })
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" yes "));
        assert!(!parse_flag(""));
        assert!(!parse_flag("no"));
    }

    #[test]
    fn test_credentials_require_all_three() {
        let mut sms = SmsConfig {
            account_sid: Some("AC123".into()),
            auth_token: Some("secret".into()),
            from_number: None,
            simulate: false,
        };
        assert!(sms.credentials().is_none());
        sms.from_number = Some("+15005550006".into());
        assert_eq!(sms.credentials(), Some(("AC123", "secret", "+15005550006")));
    }
}
