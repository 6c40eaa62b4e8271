//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{RegistrarError, Result};

const ESEWA_LIVE_URL: &str = "https://esewa.com.np/epay";
const ESEWA_UAT_URL: &str = "https://uat.esewa.com.np/epay";
const KHALTI_LIVE_URL: &str = "https://khalti.com/api/v2";
const KHALTI_SANDBOX_URL: &str = "https://dev.khalti.com/api/v2";

/// Which set of gateway hosts to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Test,
}

impl Environment {
    fn from_label(label: &str) -> Self {
        if label.eq_ignore_ascii_case("production") {
            Self::Production
        } else {
            Self::Test
        }
    }
}

#[derive(Debug, Clone)]
pub struct EsewaConfig {
    /// Merchant code (`scd`) issued by eSewa.
    pub merchant_id: String,
    /// Base of the `epay` endpoints; `/main` and `/transrec` are appended.
    pub base_url: String,
    pub success_url: String,
    pub failure_url: String,
}

#[derive(Debug, Clone)]
pub struct KhaltiConfig {
    /// Live or test secret key, sent as `Authorization: Key <secret>`.
    pub secret_key: String,
    /// Base of the v2 API (e.g. https://khalti.com/api/v2)
    pub base_url: String,
    pub return_url: String,
    pub website_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailProvider {
    SendGrid { api_key: String },
    Resend { api_key: String },
    /// Notifications are only logged.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub provider: EmailProvider,
    pub from: String,
    pub site_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the REST API server
    pub api_port: u16,
    pub environment: Environment,
    pub esewa: EsewaConfig,
    pub khalti: KhaltiConfig,
    /// Upper bound on any single gateway or email provider request
    pub gateway_timeout: Duration,
    /// SQLite database; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub email: EmailConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup so tests don't
    /// have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let site_url = var("SITE_URL")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();
        let success_url = format!("{site_url}/payment/success");
        let failure_url = format!("{site_url}/payment/failure");

        let environment = Environment::from_label(&var("APP_ENV").unwrap_or_default());
        let (esewa_default, khalti_default) = match environment {
            Environment::Production => (ESEWA_LIVE_URL, KHALTI_LIVE_URL),
            Environment::Test => (ESEWA_UAT_URL, KHALTI_SANDBOX_URL),
        };

        let provider = match var("EMAIL_PROVIDER")
            .unwrap_or_else(|| "sendgrid".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "sendgrid" => var("SENDGRID_API_KEY")
                .map(|api_key| EmailProvider::SendGrid { api_key })
                .unwrap_or(EmailProvider::Disabled),
            "resend" => var("RESEND_API_KEY")
                .map(|api_key| EmailProvider::Resend { api_key })
                .unwrap_or(EmailProvider::Disabled),
            "none" => EmailProvider::Disabled,
            other => {
                return Err(RegistrarError::Config(format!(
                    "Unknown EMAIL_PROVIDER: {other}"
                )))
            }
        };

        Ok(Config {
            api_port: var("API_PORT")
                .unwrap_or_else(|| "3000".to_string())
                .parse()
                .map_err(|_| RegistrarError::Config("Invalid API_PORT".to_string()))?,
            environment,
            esewa: EsewaConfig {
                merchant_id: var("ESEWA_MERCHANT_ID").unwrap_or_default(),
                base_url: trim_base(var("ESEWA_BASE_URL"), esewa_default),
                success_url: success_url.clone(),
                failure_url,
            },
            khalti: KhaltiConfig {
                secret_key: var("KHALTI_SECRET_KEY").unwrap_or_default(),
                base_url: trim_base(var("KHALTI_BASE_URL"), khalti_default),
                return_url: success_url,
                website_url: site_url.clone(),
            },
            gateway_timeout: Duration::from_secs(
                var("GATEWAY_TIMEOUT_SECS")
                    .unwrap_or_else(|| "15".to_string())
                    .parse()
                    .map_err(|_| {
                        RegistrarError::Config("Invalid GATEWAY_TIMEOUT_SECS".to_string())
                    })?,
            ),
            database_url: var("DATABASE_URL"),
            email: EmailConfig {
                provider,
                from: var("EMAIL_FROM")
                    .unwrap_or_else(|| "Nepal Legal Services <noreply@nepallegal.com>".to_string()),
                site_url,
            },
        })
    }
}

fn trim_base(value: Option<String>, default: &str) -> String {
    value
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}
