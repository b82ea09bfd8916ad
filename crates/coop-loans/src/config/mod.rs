use std::env;
use std::fmt;
use std::fs::File;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::workflows::loans::{
    AssignmentMode, FormLinkTemplate, LinkError, OfficerPool, ResponseWindow, WorkflowSettings,
};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub loans: LoanConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            loans: LoanConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Loan workflow settings read from `LOAN_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanConfig {
    pub group_prefix: String,
    pub group_width: usize,
    pub response_window_periods: u32,
    pub period_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub auto_assign: bool,
    pub officer_pool_csv: Option<PathBuf>,
    pub applicant_form_url: Option<String>,
    pub guarantor_form_url: Option<String>,
    pub officer_form_url: Option<String>,
}

impl Default for LoanConfig {
    fn default() -> Self {
        Self {
            group_prefix: "LC".to_string(),
            group_width: 4,
            response_window_periods: 7,
            period_seconds: 86_400,
            sweep_interval_seconds: 86_400,
            auto_assign: false,
            officer_pool_csv: None,
            applicant_form_url: None,
            guarantor_form_url: None,
            officer_form_url: None,
        }
    }
}

impl LoanConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let group_prefix = optional_var("LOAN_GROUP_PREFIX").unwrap_or(defaults.group_prefix);
        if group_prefix.len() != 2 || !group_prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::InvalidGroupPrefix(group_prefix));
        }

        let group_width = parse_var("LOAN_GROUP_WIDTH", defaults.group_width)?;
        if !(1..=12).contains(&group_width) {
            return Err(ConfigError::InvalidNumber {
                var: "LOAN_GROUP_WIDTH",
                value: group_width.to_string(),
            });
        }

        let response_window_periods =
            parse_var("LOAN_RESPONSE_WINDOW_PERIODS", defaults.response_window_periods)?;
        let period_seconds = parse_var("LOAN_PERIOD_SECONDS", defaults.period_seconds)?;
        for (var, value) in [
            ("LOAN_RESPONSE_WINDOW_PERIODS", u64::from(response_window_periods)),
            ("LOAN_PERIOD_SECONDS", period_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidNumber {
                    var,
                    value: value.to_string(),
                });
            }
        }

        let sweep_interval_seconds = parse_var("LOAN_SWEEP_INTERVAL_SECONDS", period_seconds)?;
        if sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "LOAN_SWEEP_INTERVAL_SECONDS",
                value: "0".to_string(),
            });
        }

        let auto_assign = match optional_var("LOAN_AUTO_ASSIGN") {
            None => defaults.auto_assign,
            Some(raw) => parse_flag(&raw).ok_or(ConfigError::InvalidFlag {
                var: "LOAN_AUTO_ASSIGN",
                value: raw,
            })?,
        };

        Ok(Self {
            group_prefix: group_prefix.to_ascii_uppercase(),
            group_width,
            response_window_periods,
            period_seconds,
            sweep_interval_seconds,
            auto_assign,
            officer_pool_csv: optional_var("LOAN_OFFICER_POOL_CSV").map(PathBuf::from),
            applicant_form_url: optional_var("LOAN_APPLICANT_FORM_URL"),
            guarantor_form_url: optional_var("LOAN_GUARANTOR_FORM_URL"),
            officer_form_url: optional_var("LOAN_OFFICER_FORM_URL"),
        })
    }

    pub fn response_window(&self) -> ResponseWindow {
        let period = i64::try_from(self.period_seconds).unwrap_or(i64::MAX);
        ResponseWindow {
            period: chrono::Duration::seconds(period),
            periods: self.response_window_periods,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Load the officer pool sheet, if one is configured.
    pub fn officer_pool(&self) -> Result<OfficerPool, ConfigError> {
        let Some(path) = &self.officer_pool_csv else {
            return Ok(OfficerPool::default());
        };
        let file = File::open(path).map_err(|source| ConfigError::OfficerPoolFile {
            path: path.clone(),
            source,
        })?;
        OfficerPool::from_csv_reader(file).map_err(|source| ConfigError::OfficerPoolParse {
            path: path.clone(),
            source,
        })
    }

    pub fn form_links(&self) -> Result<FormLinkTemplate, ConfigError> {
        FormLinkTemplate::from_urls(
            self.applicant_form_url.as_deref(),
            self.guarantor_form_url.as_deref(),
            self.officer_form_url.as_deref(),
        )
        .map_err(ConfigError::FormUrl)
    }

    /// Everything the workflow service is constructed with.
    pub fn workflow_settings(&self) -> Result<WorkflowSettings, ConfigError> {
        Ok(WorkflowSettings {
            id_prefix: self.group_prefix.clone(),
            id_width: self.group_width,
            window: self.response_window(),
            assignment: if self.auto_assign {
                AssignmentMode::Automatic
            } else {
                AssignmentMode::Manual
            },
            officer_pool: self.officer_pool()?,
            links: self.form_links()?,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { var: name, value: raw }),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidGroupPrefix(String),
    InvalidNumber { var: &'static str, value: String },
    InvalidFlag { var: &'static str, value: String },
    OfficerPoolFile { path: PathBuf, source: std::io::Error },
    OfficerPoolParse { path: PathBuf, source: csv::Error },
    FormUrl(LinkError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidGroupPrefix(value) => write!(
                f,
                "LOAN_GROUP_PREFIX must be two ASCII letters, got '{value}'"
            ),
            ConfigError::InvalidNumber { var, value } => {
                write!(f, "{var} must be a positive whole number, got '{value}'")
            }
            ConfigError::InvalidFlag { var, value } => {
                write!(f, "{var} must be true or false, got '{value}'")
            }
            ConfigError::OfficerPoolFile { path, .. } => {
                write!(f, "officer pool '{}' could not be opened", path.display())
            }
            ConfigError::OfficerPoolParse { path, .. } => {
                write!(f, "officer pool '{}' is not a valid sheet", path.display())
            }
            ConfigError::FormUrl(err) => write!(f, "intake form link: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::OfficerPoolFile { source, .. } => Some(source),
            ConfigError::OfficerPoolParse { source, .. } => Some(source),
            ConfigError::FormUrl(err) => Some(err),
            ConfigError::InvalidPort
            | ConfigError::InvalidGroupPrefix(_)
            | ConfigError::InvalidNumber { .. }
            | ConfigError::InvalidFlag { .. } => None,
        }
    }
}
