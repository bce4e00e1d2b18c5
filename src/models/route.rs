use anyhow::{bail, Context};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A public proxy identifier mapped to one origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TenantRoute {
    pub tenant_id: String,
    pub identifier: String,
    pub origin_base_url: String,
    pub owner: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRoute {
    pub tenant_id: String,
    pub identifier: String,
    pub origin_base_url: String,
    pub owner: Option<String>,
}

impl NewRoute {
    /// Reject identifiers that cannot be addressed as a single path segment
    /// and origins that are not absolute http(s) URLs.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tenant_id.trim().is_empty() {
            bail!("tenant id cannot be empty");
        }

        if self.identifier.is_empty() || self.identifier.len() > 64 {
            bail!("identifier must be 1-64 characters");
        }

        if !self
            .identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("identifier may only contain ASCII letters, digits, '-' and '_'");
        }

        let url = Url::parse(&self.origin_base_url)
            .with_context(|| format!("origin '{}' is not a valid URL", self.origin_base_url))?;

        if !matches!(url.scheme(), "http" | "https") {
            bail!("origin must use http or https");
        }

        if url.host_str().is_none() {
            bail!("origin must include a host");
        }

        Ok(())
    }
}
