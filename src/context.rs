//! Immutable, request-scoped tenant binding.
//!
//! A [`TenantContext`] can only be built from a fully populated, validated triple, so
//! holding one is proof that isolation can be enforced. There are no setters: code that
//! needs another tenant builds another context.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Longest identifier Postgres accepts without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for TenantId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::MissingTenantContext);
        }
        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|e| Error::InvalidTenantContext(format!("tenant id `{trimmed}`: {e}")))
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of a tenant's logical partition (a Postgres schema).
///
/// Restricted to lowercase ASCII letters, digits and `_`, starting with a letter or `_`,
/// so it is always a valid unquoted identifier and can never smuggle SQL into a
/// `search_path`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionLocator(String);

impl PartitionLocator {
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value = value.as_ref().trim();
        if value.is_empty() {
            return Err(Error::MissingTenantContext);
        }
        if value.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::InvalidTenantContext(format!(
                "partition `{value}` exceeds {MAX_IDENTIFIER_LEN} bytes"
            )));
        }
        let mut chars = value.chars();
        let first_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !first_ok || !rest_ok {
            return Err(Error::InvalidTenantContext(format!(
                "partition `{value}` is not a plain lowercase identifier"
            )));
        }
        if value.starts_with("pg_") || value == "information_schema" {
            return Err(Error::InvalidTenantContext(format!(
                "partition `{value}` is a reserved schema"
            )));
        }
        Ok(Self(value.to_string()))
    }

    /// Derive a locator from a tenant slug, e.g. `test-practice` -> `tenant_test_practice`.
    pub fn for_slug(slug: &str) -> Result<Self> {
        let mut normalized = String::with_capacity(slug.len());
        for ch in slug.trim().chars() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                normalized.push(ch.to_ascii_lowercase());
            } else {
                normalized.push('_');
            }
        }
        if normalized.is_empty() {
            return Err(Error::MissingTenantContext);
        }
        Self::parse(format!("tenant_{normalized}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PartitionLocator {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<PartitionLocator> for String {
    fn from(value: PartitionLocator) -> Self {
        value.0
    }
}

impl AsRef<str> for PartitionLocator {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTenantContext", into = "RawTenantContext")]
pub struct TenantContext {
    id: TenantId,
    slug: String,
    partition: PartitionLocator,
}

impl TenantContext {
    pub fn new(id: TenantId, slug: impl Into<String>, partition: PartitionLocator) -> Result<Self> {
        let slug = slug.into();
        let slug = slug.trim();
        if slug.is_empty() {
            return Err(Error::MissingTenantContext);
        }
        Ok(Self {
            id,
            slug: slug.to_string(),
            partition,
        })
    }

    /// Build a context from loosely typed carriers (token claims, envelope fields).
    ///
    /// Any absent or blank field is a missing context; a present but malformed field is
    /// an invalid one.
    pub fn from_parts(id: Option<&str>, slug: Option<&str>, partition: Option<&str>) -> Result<Self> {
        let (Some(id), Some(slug), Some(partition)) = (
            non_blank(id),
            non_blank(slug),
            non_blank(partition),
        ) else {
            return Err(Error::MissingTenantContext);
        };
        Self::new(id.parse()?, slug, PartitionLocator::parse(partition)?)
    }

    pub fn id(&self) -> TenantId {
        self.id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn partition(&self) -> &PartitionLocator {
        &self.partition
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) @ {}", self.slug, self.id, self.partition)
    }
}

/// Fail-fast gate for call sites that receive an optional context from an outer layer.
pub fn require(context: Option<&TenantContext>) -> Result<&TenantContext> {
    context.ok_or(Error::MissingTenantContext)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Serialize, Deserialize)]
struct RawTenantContext {
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    tenant_slug: Option<String>,
    #[serde(default)]
    tenant_schema: Option<String>,
}

impl TryFrom<RawTenantContext> for TenantContext {
    type Error = Error;

    fn try_from(raw: RawTenantContext) -> Result<Self> {
        Self::from_parts(
            raw.tenant_id.as_deref(),
            raw.tenant_slug.as_deref(),
            raw.tenant_schema.as_deref(),
        )
    }
}

impl From<TenantContext> for RawTenantContext {
    fn from(ctx: TenantContext) -> Self {
        Self {
            tenant_id: Some(ctx.id.to_string()),
            tenant_slug: Some(ctx.slug),
            tenant_schema: Some(ctx.partition.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "6f1c2a8e-8d55-4d39-9a57-0f3f8c1b2d11";

    #[test]
    fn builds_from_complete_parts() {
        let ctx = TenantContext::from_parts(Some(ID), Some("north-clinic"), Some("tenant_north"))
            .expect("valid context");
        assert_eq!(ctx.id().to_string(), ID);
        assert_eq!(ctx.slug(), "north-clinic");
        assert_eq!(ctx.partition().as_str(), "tenant_north");
    }

    #[test]
    fn blank_or_absent_parts_are_missing() {
        for (id, slug, part) in [
            (None, Some("a"), Some("tenant_a")),
            (Some(ID), None, Some("tenant_a")),
            (Some(ID), Some("a"), None),
            (Some(""), Some("a"), Some("tenant_a")),
            (Some(ID), Some("  "), Some("tenant_a")),
            (Some(ID), Some("a"), Some("")),
        ] {
            let err = TenantContext::from_parts(id, slug, part).unwrap_err();
            assert!(matches!(err, Error::MissingTenantContext), "{err:?}");
        }
    }

    #[test]
    fn malformed_parts_are_invalid() {
        let err = TenantContext::from_parts(Some("not-a-uuid"), Some("a"), Some("tenant_a"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTenantContext(_)));

        for bad in ["Tenant_A", "tenant-a", "1tenant", "tenant_a; drop table users", "pg_catalog"] {
            let err = PartitionLocator::parse(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidTenantContext(_)), "{bad}");
        }
    }

    #[test]
    fn slug_derives_partition() {
        let loc = PartitionLocator::for_slug("Test-Practice").unwrap();
        assert_eq!(loc.as_str(), "tenant_test_practice");
    }

    #[test]
    fn serde_uses_claim_names_and_validates() {
        let ctx = TenantContext::from_parts(Some(ID), Some("north"), Some("tenant_north")).unwrap();
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["tenant_schema"], "tenant_north");

        let back: TenantContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);

        let broken = serde_json::json!({ "tenant_id": ID, "tenant_slug": "north" });
        assert!(serde_json::from_value::<TenantContext>(broken).is_err());
    }

    #[test]
    fn require_rejects_absent_context() {
        assert!(matches!(require(None), Err(Error::MissingTenantContext)));
    }
}
