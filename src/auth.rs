//! Login flow and the signed identity token that carries the tenant binding between
//! requests.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::context::TenantContext;
use crate::directory::Tenant;
use crate::resolver::{Account, TenantResolver};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantClaims {
    pub sub: String,
    pub email: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_schema: Option<String>,
}

impl TenantClaims {
    /// Rebuild the request's tenant binding from the token.
    ///
    /// Malformed claims are always rejected. Absent claims are rejected unless
    /// `allow_legacy` is set, in which case the token is treated as pre-isolation and
    /// `Ok(None)` is returned.
    pub fn into_context(&self, allow_legacy: bool) -> Result<Option<TenantContext>> {
        match TenantContext::from_parts(
            self.tenant_id.as_deref(),
            self.tenant_slug.as_deref(),
            self.tenant_schema.as_deref(),
        ) {
            Ok(ctx) => Ok(Some(ctx)),
            Err(Error::MissingTenantContext) if allow_legacy => {
                tracing::warn!(
                    target: "tenantry::auth",
                    sub = %self.sub,
                    jti = %self.jti,
                    "token without tenant claims accepted on the legacy path"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Authenticated {
    pub claims: TenantClaims,
    /// `None` only on the legacy path.
    pub tenant: Option<TenantContext>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl: Duration,
    allow_legacy_claims: bool,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        if config.jwt_secret.trim().is_empty() {
            return Err(Error::Config("jwt secret is required".into()));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            issuer: config.issuer.clone(),
            ttl: config.access_ttl,
            allow_legacy_claims: config.allow_legacy_claims,
        })
    }

    pub fn issue(&self, account: &Account, tenant: &TenantContext) -> Result<IssuedToken> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| Error::Config(format!("access token ttl: {e}")))?;
        let expires_at = now + ttl;
        let claims = TenantClaims {
            sub: account.id.to_string(),
            email: account.email.clone(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            tenant_id: Some(tenant.id().to_string()),
            tenant_slug: Some(tenant.slug().to_string()),
            tenant_schema: Some(tenant.partition().to_string()),
        };
        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken {
            access_token,
            token_type: "Bearer",
            expires_at,
        })
    }

    pub fn verify(&self, token: &str) -> Result<TenantClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        let decoded = decode::<TenantClaims>(token, &self.decoding, &validation)?;
        Ok(decoded.claims)
    }

    /// Verify the token and rebuild its tenant binding under the configured legacy policy.
    pub fn authenticate(&self, token: &str) -> Result<Authenticated> {
        let claims = self.verify(token)?;
        let tenant = claims.into_context(self.allow_legacy_claims)?;
        Ok(Authenticated { claims, tenant })
    }
}

#[derive(Clone, Debug)]
pub struct LoginOutcome {
    pub token: IssuedToken,
    pub account_id: Uuid,
    pub tenant: Tenant,
}

#[derive(Clone)]
pub struct LoginService {
    resolver: TenantResolver,
    issuer: Arc<TokenIssuer>,
    hash_cost: u32,
    dummy_hash: Arc<OnceLock<String>>,
}

impl LoginService {
    pub fn new(resolver: TenantResolver, issuer: TokenIssuer) -> Self {
        Self {
            resolver,
            issuer: Arc::new(issuer),
            hash_cost: bcrypt::DEFAULT_COST,
            dummy_hash: Arc::new(OnceLock::new()),
        }
    }

    /// Cost used for the decoy hash verified when no account matches. Should equal the
    /// cost stored account hashes were created with.
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Unknown email, inactive account and wrong password all yield
    /// [`Error::InvalidCredentials`].
    #[instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        let resolution = match self.resolver.resolve(email).await {
            Ok(found) => found,
            Err(Error::InvalidCredentials) => {
                self.burn_decoy(password).await?;
                return Err(Error::InvalidCredentials);
            }
            Err(err) => return Err(err),
        };

        if !verify_password(password, &resolution.account.password_hash).await? {
            tracing::debug!(
                target: "tenantry::auth",
                tenant_id = %resolution.tenant.id(),
                "password mismatch"
            );
            return Err(Error::InvalidCredentials);
        }

        let token = self
            .issuer
            .issue(&resolution.account, resolution.tenant.context())?;
        tracing::info!(
            target: "tenantry::auth",
            tenant_id = %resolution.tenant.id(),
            user_id = %resolution.account.id,
            "login succeeded"
        );
        Ok(LoginOutcome {
            token,
            account_id: resolution.account.id,
            tenant: resolution.tenant,
        })
    }

    // Keeps the miss path as slow as a real password check.
    async fn burn_decoy(&self, password: &str) -> Result<()> {
        let password = password.to_string();
        let cost = self.hash_cost;
        let dummy = self.dummy_hash.clone();
        tokio::task::spawn_blocking(move || {
            let hash = dummy.get_or_init(|| {
                bcrypt::hash("tenantry-decoy-password", cost).unwrap_or_default()
            });
            let _ = bcrypt::verify(password, hash);
        })
        .await?;
        Ok(())
    }
}

pub async fn hash_password(password: &str, cost: u32) -> Result<String> {
    let password = password.to_string();
    let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;
    Ok(hashed)
}

pub async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    let ok = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await??;
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(allow_legacy: bool) -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".into(),
            allow_legacy_claims: allow_legacy,
            ..AuthConfig::default()
        }
    }

    fn claims(tenant: Option<(&str, &str, &str)>) -> TenantClaims {
        TenantClaims {
            sub: Uuid::new_v4().to_string(),
            email: "a@x.com".into(),
            iss: "tenantry".into(),
            iat: 0,
            exp: 0,
            jti: "j".into(),
            tenant_id: tenant.map(|t| t.0.to_string()),
            tenant_slug: tenant.map(|t| t.1.to_string()),
            tenant_schema: tenant.map(|t| t.2.to_string()),
        }
    }

    #[test]
    fn missing_claims_follow_legacy_policy() {
        let legacy = claims(None);
        assert!(matches!(
            legacy.into_context(false),
            Err(Error::MissingTenantContext)
        ));
        assert_eq!(legacy.into_context(true).unwrap(), None);
    }

    #[test]
    fn malformed_claims_never_take_legacy_path() {
        let bad = claims(Some(("not-a-uuid", "north", "tenant_north")));
        assert!(matches!(
            bad.into_context(true),
            Err(Error::InvalidTenantContext(_))
        ));
    }

    #[test]
    fn rejects_empty_secret() {
        assert!(matches!(
            TokenIssuer::new(&AuthConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn tokens_from_another_issuer_fail() {
        let issuer = TokenIssuer::new(&config(false)).unwrap();
        let other = TokenIssuer::new(&AuthConfig {
            issuer: "someone-else".into(),
            ..config(false)
        })
        .unwrap();
        let account = Account {
            id: Uuid::new_v4(),
            email: "a@x.com".into(),
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            status: "active".into(),
        };
        let tenant = TenantContext::from_parts(
            Some(&Uuid::new_v4().to_string()),
            Some("north"),
            Some("tenant_north"),
        )
        .unwrap();
        let token = other.issue(&account, &tenant).unwrap();
        assert!(matches!(
            issuer.verify(&token.access_token),
            Err(Error::Token(_))
        ));
    }
}
