//! Configuration types, loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub smtp: SmtpConfig,
    pub scheduler: SchedulerConfig,
    /// Directory for daily rolling log files; stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

/// Which mailbox backend feeds the pipeline.
#[derive(Debug, Clone)]
pub enum SourceConfig {
    Imap(ImapConfig),
    Gmail(GmailConfig),
}

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
}

#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub refresh_token: SecretString,
    /// Mailbox owner; "me" means the authenticated account.
    pub user_id: String,
    pub api_base: String,
    pub token_url: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub stop_grace: Duration,
    /// How far back the first fetch after startup reaches.
    pub lookback: Duration,
    pub autostart: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            stop_grace: Duration::from_secs(30),
            lookback: Duration::from_secs(24 * 3600),
            autostart: true,
        }
    }
}

pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_DB_PATH: &str = "./data/mail-relay.db";
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

impl RelayConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let server = ServerConfig {
            port: env.parse_or("RELAY_API_PORT", DEFAULT_API_PORT)?,
        };

        let database = DatabaseConfig {
            path: env
                .get("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
        };

        let source = match env.get("RELAY_SOURCE").as_deref().unwrap_or("imap") {
            "imap" => SourceConfig::Imap(ImapConfig {
                host: env.get("RELAY_IMAP_HOST").unwrap_or_else(|| "imap.gmail.com".into()),
                port: env.parse_or("RELAY_IMAP_PORT", 993)?,
                username: env.get("RELAY_IMAP_USER").unwrap_or_default(),
                password: env.secret("RELAY_IMAP_PASSWORD"),
                mailbox: env.get("RELAY_IMAP_MAILBOX").unwrap_or_else(|| "INBOX".into()),
            }),
            "gmail" => SourceConfig::Gmail(GmailConfig {
                client_id: env.get("RELAY_GMAIL_CLIENT_ID").unwrap_or_default(),
                client_secret: env.secret("RELAY_GMAIL_CLIENT_SECRET"),
                refresh_token: env.secret("RELAY_GMAIL_REFRESH_TOKEN"),
                user_id: env.get("RELAY_GMAIL_USER").unwrap_or_else(|| "me".into()),
                api_base: env
                    .get("RELAY_GMAIL_API_BASE")
                    .unwrap_or_else(|| GMAIL_API_BASE.into()),
                token_url: env
                    .get("RELAY_GMAIL_TOKEN_URL")
                    .unwrap_or_else(|| GOOGLE_TOKEN_URL.into()),
            }),
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "RELAY_SOURCE".into(),
                    message: format!("expected 'imap' or 'gmail', got '{other}'"),
                });
            }
        };

        let smtp_username = env.get("RELAY_SMTP_USER").unwrap_or_default();
        let smtp = SmtpConfig {
            host: env.get("RELAY_SMTP_HOST").unwrap_or_default(),
            port: env.parse_or("RELAY_SMTP_PORT", 587)?,
            from_address: env
                .get("RELAY_SMTP_FROM")
                .unwrap_or_else(|| smtp_username.clone()),
            username: smtp_username,
            password: env.secret("RELAY_SMTP_PASSWORD"),
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            interval: env.scaled_secs("RELAY_INTERVAL_MINUTES", defaults.interval, 60)?,
            stop_grace: Duration::from_secs(
                env.parse_or("RELAY_STOP_GRACE_SECS", defaults.stop_grace.as_secs())?,
            ),
            lookback: env.scaled_secs("RELAY_LOOKBACK_HOURS", defaults.lookback, 3600)?,
            autostart: env.parse_or("RELAY_AUTOSTART", defaults.autostart)?,
        };

        let config = Self {
            server,
            database,
            source,
            smtp,
            scheduler,
            log_dir: env.get("RELAY_LOG_DIR").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the chosen source has credentials, the sink can send and
    /// the interval is positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.source {
            SourceConfig::Imap(imap) => {
                require(&imap.username, "RELAY_IMAP_USER", "IMAP credentials are required")?;
                require(
                    imap.password.expose_secret(),
                    "RELAY_IMAP_PASSWORD",
                    "IMAP credentials are required",
                )?;
            }
            SourceConfig::Gmail(gmail) => {
                let hint = "Gmail OAuth2 credentials are required";
                require(&gmail.client_id, "RELAY_GMAIL_CLIENT_ID", hint)?;
                require(
                    gmail.client_secret.expose_secret(),
                    "RELAY_GMAIL_CLIENT_SECRET",
                    hint,
                )?;
                require(
                    gmail.refresh_token.expose_secret(),
                    "RELAY_GMAIL_REFRESH_TOKEN",
                    hint,
                )?;
            }
        }

        require(&self.smtp.host, "RELAY_SMTP_HOST", "Forwarding needs an SMTP server")?;
        require(
            &self.smtp.from_address,
            "RELAY_SMTP_FROM",
            "Set RELAY_SMTP_FROM or RELAY_SMTP_USER",
        )?;

        if self.scheduler.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_INTERVAL_MINUTES".into(),
                message: "scheduler interval must be greater than 0".into(),
            });
        }
        let now = Utc::now();
        if chrono::Duration::from_std(self.scheduler.interval)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .is_none()
        {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_INTERVAL_MINUTES".into(),
                message: "scheduler interval is out of range".into(),
            });
        }
        if chrono::Duration::from_std(self.scheduler.lookback)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .is_none()
        {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_LOOKBACK_HOURS".into(),
                message: "lookback window is out of range".into(),
            });
        }
        Ok(())
    }

    pub fn source_name(&self) -> &'static str {
        match self.source {
            SourceConfig::Imap(_) => "imap",
            SourceConfig::Gmail(_) => "gmail",
        }
    }
}

fn require(value: &str, key: &str, hint: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingRequired {
            key: key.into(),
            hint: hint.into(),
        });
    }
    Ok(())
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value for `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn secret(&self, key: &str) -> SecretString {
        SecretString::from(self.get(key).unwrap_or_default())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.into(),
                message: format!("'{raw}': {e}"),
            }),
            None => Ok(default),
        }
    }

    /// A count of `unit_secs`-second units, e.g. minutes or hours.
    fn scaled_secs(
        &self,
        key: &str,
        default: Duration,
        unit_secs: u64,
    ) -> Result<Duration, ConfigError> {
        let count = self.parse_or::<u64>(key, default.as_secs() / unit_secs)?;
        count
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: key.into(),
                message: format!("'{count}' is too large"),
            })
    }
}
