use std::{fmt, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use miette::{Context, Diagnostic, IntoDiagnostic, Result};
use serde::Deserialize;
use smtp::ServerConfig;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::filters::{DefaultAction, Policies, PolicyRuleSet};

/// Keys that accept a comma-separated list when set from the environment.
const LIST_KEYS: [&str; 4] = [
    "smtp.policies.from.allow",
    "smtp.policies.from.deny",
    "smtp.policies.to.allow",
    "smtp.policies.to.deny",
];

#[derive(Debug, Deserialize, Clone)]
pub struct Cfg {
    pub log: CfgLog,
    pub smtp: CfgSmtp,
    #[serde(default)]
    pub slack: CfgSlack,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgLog {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Fmt,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgSmtp {
    pub listen_addr: String,
    pub hostname: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub queue_capacity: usize,
    /// Deliver the HTML body when present, falling back to plain text.
    pub prefer_html_body: bool,
    pub auth: CfgAuth,
    pub policies: Policies,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgAuth {
    pub enabled: bool,
    pub user_database: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct CfgSlack {
    pub token: Option<Secret>,
    pub token_file: Option<Utf8PathBuf>,
}

/// Values that take precedence over the config file. Filled from the command
/// line first, then from the `LOG_LEVEL` and `SLACK_TOKEN` environment variables.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub listen_addr: Option<String>,
    pub auth_enabled: Option<bool>,
    pub user_database: Option<Utf8PathBuf>,
    pub slack_token: Option<String>,
    pub slack_token_file: Option<Utf8PathBuf>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Overrides {
            log_level: std::env::var("LOG_LEVEL").ok(),
            slack_token: std::env::var("SLACK_TOKEN").ok(),
            ..Overrides::default()
        }
    }

    /// Fills every unset field from `fallback`.
    pub fn or(self, fallback: Overrides) -> Overrides {
        Overrides {
            log_level: self.log_level.or(fallback.log_level),
            listen_addr: self.listen_addr.or(fallback.listen_addr),
            auth_enabled: self.auth_enabled.or(fallback.auth_enabled),
            user_database: self.user_database.or(fallback.user_database),
            slack_token: self.slack_token.or(fallback.slack_token),
            slack_token_file: self.slack_token_file.or(fallback.slack_token_file),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration: {}", violations.join("; "))]
    #[diagnostic(
        code(config::invalid),
        help("fix the listed settings in the config file, environment or flags")
    )]
    Invalid { violations: Vec<String> },
}

impl Cfg {
    /// Assembles the configuration from defaults, the optional TOML file at
    /// `cfg_path`, `SMTP2SLACK__*` environment variables and `overrides`,
    /// in increasing order of precedence.
    pub fn load(cfg_path: &Utf8Path, overrides: &Overrides) -> Result<Self> {
        Self::load_with_env(cfg_path, overrides, environment())
    }

    fn load_with_env(cfg_path: &Utf8Path, overrides: &Overrides, env: Environment) -> Result<Self> {
        let settings = Config::builder()
            .set_default("log.level", "info")
            .and_then(|b| b.set_default("log.format", "fmt"))
            .and_then(|b| b.set_default("smtp.listen_addr", "localhost:25"))
            .and_then(|b| b.set_default("smtp.hostname", "localhost"))
            .and_then(|b| b.set_default("smtp.read_timeout_secs", 10_i64))
            .and_then(|b| b.set_default("smtp.write_timeout_secs", 10_i64))
            .and_then(|b| b.set_default("smtp.max_message_bytes", 1_048_576_i64))
            .and_then(|b| b.set_default("smtp.max_recipients", 50_i64))
            .and_then(|b| b.set_default("smtp.queue_capacity", 100_i64))
            .and_then(|b| b.set_default("smtp.prefer_html_body", true))
            .and_then(|b| b.set_default("smtp.auth.enabled", false))
            .and_then(|b| b.set_default("smtp.policies.from.allow", Vec::<String>::new()))
            .and_then(|b| b.set_default("smtp.policies.from.deny", Vec::<String>::new()))
            .and_then(|b| b.set_default("smtp.policies.from.default_action", "allow"))
            .and_then(|b| b.set_default("smtp.policies.to.allow", Vec::<String>::new()))
            .and_then(|b| b.set_default("smtp.policies.to.deny", Vec::<String>::new()))
            .and_then(|b| b.set_default("smtp.policies.to.default_action", "deny"))
            .into_diagnostic()?
            .add_source(File::new(cfg_path.as_str(), FileFormat::Toml).required(false))
            .add_source(env)
            .set_override_option("log.level", overrides.log_level.clone())
            .and_then(|b| b.set_override_option("smtp.listen_addr", overrides.listen_addr.clone()))
            .and_then(|b| b.set_override_option("smtp.auth.enabled", overrides.auth_enabled))
            .and_then(|b| {
                b.set_override_option(
                    "smtp.auth.user_database",
                    overrides.user_database.as_ref().map(|p| p.to_string()),
                )
            })
            .and_then(|b| b.set_override_option("slack.token", overrides.slack_token.clone()))
            .and_then(|b| {
                b.set_override_option(
                    "slack.token_file",
                    overrides.slack_token_file.as_ref().map(|p| p.to_string()),
                )
            })
            .into_diagnostic()?
            .build()
            .into_diagnostic()
            .wrap_err_with(|| format!("reading config file {cfg_path}"))?;

        let mut cfg: Cfg = settings
            .try_deserialize()
            .into_diagnostic()
            .wrap_err("parsing configuration")?;

        if let Some(token_file) = &cfg.slack.token_file {
            let token = std::fs::read_to_string(token_file)
                .into_diagnostic()
                .wrap_err_with(|| format!("reading slack token file {token_file}"))?;
            cfg.slack.token = Some(Secret::new(token.trim()));
        }

        Ok(cfg)
    }

    /// Checks the assembled configuration and reports every violation at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if EnvFilter::try_new(&self.log.level).is_err() {
            violations.push(format!("log.level '{}' is not a valid level", self.log.level));
        }
        if self.smtp.listen_addr.trim().is_empty() {
            violations.push("smtp.listen_addr is required".to_string());
        }
        if self.smtp.hostname.trim().is_empty() {
            violations.push("smtp.hostname is required".to_string());
        }
        if self.smtp.read_timeout_secs == 0 || self.smtp.write_timeout_secs == 0 {
            violations.push("smtp timeouts must be greater than zero".to_string());
        }
        if self.smtp.max_message_bytes == 0 {
            violations.push("smtp.max_message_bytes must be greater than zero".to_string());
        }
        if self.smtp.max_recipients == 0 {
            violations.push("smtp.max_recipients must be greater than zero".to_string());
        }
        if self.smtp.queue_capacity == 0 {
            violations.push("smtp.queue_capacity must be greater than zero".to_string());
        }
        if self.smtp.auth.enabled && self.smtp.auth.user_database.is_none() {
            violations.push("smtp.auth.user_database is required when auth is enabled".to_string());
        }
        for (direction, rules) in [
            ("from", &self.smtp.policies.from),
            ("to", &self.smtp.policies.to),
        ] {
            check_default_action(direction, rules, &mut violations);
        }
        match &self.slack.token {
            Some(token) if !token.is_empty() => {}
            _ => violations.push("slack.token is required".to_string()),
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { violations })
        }
    }
}

/// `SMTP2SLACK__SECTION__KEY` variables, e.g. `SMTP2SLACK__SMTP__POLICIES__TO__ALLOW`.
fn environment() -> Environment {
    LIST_KEYS.into_iter().fold(
        Environment::with_prefix("SMTP2SLACK")
            .separator("__")
            .list_separator(",")
            .try_parsing(true),
        |env, key| env.with_list_parse_key(key),
    )
}

fn check_default_action(direction: &str, rules: &PolicyRuleSet, violations: &mut Vec<String>) {
    if let DefaultAction::Unrecognized(action) = &rules.default_action {
        violations.push(format!(
            "smtp.policies.{direction}.default_action must be 'allow' or 'deny', got '{action}'"
        ));
    }
}

impl CfgSmtp {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            hostname: self.hostname.clone(),
            auth_enabled: self.auth.enabled,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            max_message_bytes: self.max_message_bytes,
            max_recipients: self.max_recipients,
        }
    }
}

/// A string that never prints its full value.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keeps the first and last characters and stars out the rest.
    fn obfuscated(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        match chars.as_slice() {
            [] => String::new(),
            [_] => "*".to_string(),
            [first, _] => format!("{first}*"),
            [first, middle @ .., last] => {
                format!("{first}{}{last}", "*".repeat(middle.len()))
            }
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.obfuscated())
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.obfuscated())
    }
}
