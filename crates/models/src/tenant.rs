use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

/// URL schemes a tenant database address may use
pub const SUPPORTED_SCHEMES: &[&str] = &["postgres", "postgresql", "sqlite"];

const MAX_KEY_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenantKeyError {
    #[error("Tenant key cannot be empty")]
    Empty,

    #[error("Tenant key is {0} characters long, maximum is 63")]
    TooLong(usize),

    #[error("Tenant key must start with a letter")]
    InvalidStart,

    #[error("Tenant key contains invalid character '{0}'")]
    InvalidCharacter(char),
}

/// Identifier of one tenant database.
///
/// Stored in canonical upper snake case (`MAIN`, `CLIENT_A`). Tokens such as
/// `client-a` or ` Client_A ` normalize to the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantKey(String);

impl TenantKey {
    pub const MAIN: &'static str = "MAIN";

    /// Parse and normalize a tenant token
    pub fn parse(token: &str) -> Result<Self, TenantKeyError> {
        let normalized: String = token
            .trim()
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();

        if normalized.is_empty() {
            return Err(TenantKeyError::Empty);
        }
        if normalized.len() > MAX_KEY_LEN {
            return Err(TenantKeyError::TooLong(normalized.len()));
        }
        if !normalized
            .chars()
            .next()
            .map(|c| c.is_ascii_uppercase())
            .unwrap_or(false)
        {
            return Err(TenantKeyError::InvalidStart);
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_'))
        {
            return Err(TenantKeyError::InvalidCharacter(bad));
        }

        Ok(Self(normalized))
    }

    /// The conventional default tenant
    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-case dashed form used in URLs and request parameters
    pub fn slug(&self) -> String {
        self.0.to_ascii_lowercase().replace('_', "-")
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantKey {
    type Err = TenantKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantKey {
    type Error = TenantKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantKey> for String {
    fn from(key: TenantKey) -> Self {
        key.0
    }
}

/// Connection parameters for one tenant database
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct ConnectionParams {
    /// Database URL (`postgres://host:5432/db` or `sqlite:...`)
    #[validate(length(min = 1, message = "address cannot be empty"))]
    pub address: String,

    #[validate(length(min = 1, message = "username cannot be empty"))]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: String,
}

impl ConnectionParams {
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// URL scheme of the address, if it has one
    pub fn scheme(&self) -> Option<&str> {
        self.address
            .trim()
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .filter(|scheme| !scheme.is_empty())
    }

    /// Validate field presence plus the address scheme
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|e| e.to_string())?;

        match self.scheme() {
            Some(scheme) if SUPPORTED_SCHEMES.contains(&scheme) => Ok(()),
            Some(scheme) => Err(format!(
                "address: unsupported scheme '{}' (expected one of {})",
                scheme,
                SUPPORTED_SCHEMES.join(", ")
            )),
            None => Err("address: missing URL scheme".to_string()),
        }
    }

    /// Address with any embedded password masked, safe for logs and reports
    pub fn redacted_address(&self) -> String {
        redact_address(&self.address)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("address", &self.redacted_address())
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn redact_address(address: &str) -> String {
    let Some((scheme, rest)) = address.split_once("://") else {
        return address.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let Some(at) = rest[..authority_end].rfind('@') else {
        return address.to_string();
    };
    let userinfo = &rest[..at];
    let user = userinfo.split(':').next().unwrap_or_default();
    format!("{}://{}:***@{}", scheme, user, &rest[at + 1..])
}

/// Bounds of a tenant connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBounds {
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_min_connections() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    600
}

impl Default for PoolBounds {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl PoolBounds {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn check(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.min_connections > self.max_connections {
            return Err(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            ));
        }
        if self.acquire_timeout_secs == 0 {
            return Err("acquire_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Onboarding request accepted by the transport layer
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OnboardTenantRequest {
    #[validate(length(min = 1, message = "tenant_id cannot be empty"))]
    pub tenant_id: String,

    #[serde(flatten)]
    pub connection: ConnectionParams,

    #[serde(default)]
    pub bounds: Option<PoolBounds>,
}
