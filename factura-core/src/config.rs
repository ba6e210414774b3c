//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

/// Overrides the authority host for both SOAP services (test servers, proxies).
pub const BASE_URL_ENV: &str = "FACTURA_SRI_BASE_URL";

const RECEPTION_PATH: &str = "RecepcionComprobantesOffline";
const AUTHORIZATION_PATH: &str = "AutorizacionComprobantesOffline";

/// SRI environment selection.
///
/// The environment decides which SOAP endpoints the client talks to and is also
/// embedded as one digit in every access key (`1` test, `2` production).
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use factura_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("pruebas")?;
/// assert_eq!(env, EnvironmentType::Test);
/// assert_eq!(env.code(), '1');
/// # Ok::<(), factura_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    Test,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "1" | "test" | "pruebas" => Ok(EnvironmentType::Test),
            "2" | "production" | "produccion" | "producción" => {
                Ok(EnvironmentType::Production)
            }
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "test",
            EnvironmentType::Production => "production",
        }
    }

    /// Digit used in access keys and in the `ambiente` field of documents.
    pub fn code(&self) -> char {
        match self {
            EnvironmentType::Test => '1',
            EnvironmentType::Production => '2',
        }
    }

    pub fn host_url(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/",
            EnvironmentType::Production => "https://cel.sri.gob.ec/comprobantes-electronicos-ws/",
        }
    }

    pub fn reception_url(&self) -> String {
        format!("{}{RECEPTION_PATH}", self.host_url())
    }

    pub fn authorization_url(&self) -> String {
        format!("{}{AUTHORIZATION_PATH}", self.host_url())
    }
}

/// Configuration for the protocol client and the operation state machine.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use factura_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Test)
///     .with_authorization_delay(Duration::from_secs(5));
/// assert_eq!(config.request_timeout(), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: EnvironmentType,
    authorization_delay: Duration,
    request_timeout: Duration,
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            ..Self::default()
        }
    }

    pub fn with_authorization_delay(mut self, delay: Duration) -> Self {
        self.authorization_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    /// Wait between an accepted reception and the first authorization query.
    pub fn authorization_delay(&self) -> Duration {
        self.authorization_delay
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Reception endpoint, honouring [`BASE_URL_ENV`].
    pub fn reception_url(&self) -> String {
        match base_url_override() {
            Some(base) => format!("{base}{RECEPTION_PATH}"),
            None => self.env.reception_url(),
        }
    }

    /// Authorization endpoint, honouring [`BASE_URL_ENV`].
    pub fn authorization_url(&self) -> String {
        match base_url_override() {
            Some(base) => format!("{base}{AUTHORIZATION_PATH}"),
            None => self.env.authorization_url(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: EnvironmentType::Test,
            authorization_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn base_url_override() -> Option<String> {
    std::env::var(BASE_URL_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            if value.ends_with('/') {
                value
            } else {
                format!("{value}/")
            }
        })
}
