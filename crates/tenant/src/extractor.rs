// Maps the tenant token carried by a request onto a TenantKey

use multidb_models::TenantKey;

/// Request header naming the target tenant
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Query parameter naming the target tenant, e.g. `?client=client-a`
pub const TENANT_QUERY_PARAM: &str = "client";

#[derive(Debug, Clone)]
pub struct TenantSelector {
    default_key: TenantKey,
}

impl TenantSelector {
    pub fn new(default_key: TenantKey) -> Self {
        Self { default_key }
    }

    pub fn default_key(&self) -> &TenantKey {
        &self.default_key
    }

    /// Absent, blank or malformed tokens select the default tenant
    pub fn select(&self, token: Option<&str>) -> TenantKey {
        let token = match token.map(str::trim) {
            None | Some("") => return self.default_key.clone(),
            Some(token) => token,
        };

        match TenantKey::parse(token) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed tenant token '{}' ({}), using {}",
                    token,
                    e,
                    self.default_key
                );
                self.default_key.clone()
            }
        }
    }
}
