//! Session exchange (C2): turns a GitHub OAuth access token into a signed,
//! expiring session ticket.
//!
//! The identity-provider call is made with `reqwest`, the same client the
//! OAuth-flow crate uses for code exchange. The access token and the signing
//! secret are both wrapped in `secrecy::Secret` end to end so neither ever
//! reaches a `Debug` derive or a log line. The session token itself is a
//! hand-rolled HMAC-SHA256-over-JSON envelope rather than a full JWT: the
//! claims set is small and fixed, so pulling in a JWT dependency this
//! codebase doesn't otherwise use isn't worth it.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use moltis_protocol::{AccountId, UserIdentity, roles};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("identity provider request failed: {0}")]
    ProviderRequest(#[from] reqwest::Error),
    #[error("identity provider returned an unusable profile: {0}")]
    InvalidProfile(String),
    #[error("session secret is not configured or too short")]
    MissingSecret,
    #[error("session token is malformed")]
    MalformedToken,
    #[error("session token signature does not match")]
    BadSignature,
    #[error("session token has expired")]
    Expired,
}

/// A minted session, returned to the client from `/auth/exchange`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionTicket {
    pub token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at_ms: u64,
    pub user: UserIdentity,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Claims {
    subject: String,
    login: String,
    #[serde(rename = "avatarUrl")]
    avatar_url: String,
    exp: u64,
}

/// Minimal shape of GitHub's `GET /user` response.
#[derive(serde::Deserialize)]
struct GitHubUser {
    id: u64,
    login: String,
    avatar_url: String,
}

/// Mints [`SessionTicket`]s from identity-provider access tokens.
pub struct SessionIssuer {
    client: reqwest::Client,
    api_base_url: String,
    secret: Secret<String>,
    ttl_ms: u64,
    moderator_account_ids: std::collections::HashSet<String>,
}

impl SessionIssuer {
    pub fn new(
        api_base_url: String,
        secret: Secret<String>,
        ttl_ms: u64,
        moderator_account_ids: std::collections::HashSet<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base_url,
            secret,
            ttl_ms,
            moderator_account_ids,
        }
    }

    /// Call the identity provider's `/user` endpoint, then mint a session
    /// ticket bound to the resolved identity.
    pub async fn exchange(&self, access_token: &Secret<String>) -> Result<SessionTicket, SessionError> {
        let resp = self
            .client
            .get(format!("{}/user", self.api_base_url))
            .bearer_auth(access_token.expose_secret())
            .header("User-Agent", "moltis-chat")
            .send()
            .await?
            .error_for_status()?;
        let profile: GitHubUser = resp.json().await?;

        let account_id = AccountId::parse(profile.id.to_string())
            .map_err(|e| SessionError::InvalidProfile(e.to_string()))?;
        if profile.login.trim().is_empty() {
            return Err(SessionError::InvalidProfile("empty login".into()));
        }

        let mut roles = Vec::new();
        if self.moderator_account_ids.contains(account_id.as_str()) {
            roles.push(roles::MODERATOR.to_string());
        }
        let user = UserIdentity {
            account_id,
            login: profile.login,
            avatar_url: profile.avatar_url,
            roles,
        };

        self.mint(user)
    }

    /// Mint a ticket directly for an already-resolved identity, bypassing the
    /// identity-provider round trip. Used by `exchange` and by integration
    /// tests that need a valid bearer token without a live GitHub call.
    pub fn mint(&self, user: UserIdentity) -> Result<SessionTicket, SessionError> {
        let secret = self.secret.expose_secret();
        if secret.len() < 32 {
            return Err(SessionError::MissingSecret);
        }
        let now_ms = now_ms();
        let exp = now_ms + self.ttl_ms;
        let claims = Claims {
            subject: user.account_id.as_str().to_string(),
            login: user.login.clone(),
            avatar_url: user.avatar_url.clone(),
            exp,
        };
        let token = sign(secret, &claims)?;
        Ok(SessionTicket {
            token,
            expires_at_ms: exp,
            user,
        })
    }

    /// Verify a bearer token, returning the identity it was minted for.
    /// Skew-tolerant by [`SKEW_MS`] is the caller's responsibility (C3 applies
    /// it to the cached-session invariant, not to this raw verification).
    pub fn verify(&self, token: &str) -> Result<UserIdentity, SessionError> {
        let secret = self.secret.expose_secret();
        let claims = verify(secret, token)?;
        if now_ms() >= claims.exp {
            return Err(SessionError::Expired);
        }
        let account_id = AccountId::parse(claims.subject)
            .map_err(|_| SessionError::MalformedToken)?;
        let mut roles = Vec::new();
        if self.moderator_account_ids.contains(account_id.as_str()) {
            roles.push(roles::MODERATOR.to_string());
        }
        Ok(UserIdentity {
            account_id,
            login: claims.login,
            avatar_url: claims.avatar_url,
            roles,
        })
    }
}

/// Acceptable clock skew between ticket mint and verification, per the
/// `CachedSession` reuse invariant.
pub const SKEW_MS: u64 = 30_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn sign(secret: &str, claims: &Claims) -> Result<String, SessionError> {
    let body = serde_json::to_vec(claims).map_err(|_| SessionError::MalformedToken)?;
    let body_b64 = URL_SAFE_NO_PAD.encode(&body);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SessionError::MissingSecret)?;
    mac.update(body_b64.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{body_b64}.{sig}"))
}

fn verify(secret: &str, token: &str) -> Result<Claims, SessionError> {
    let (body_b64, sig_b64) = token.split_once('.').ok_or(SessionError::MalformedToken)?;
    let expected_sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| SessionError::MalformedToken)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SessionError::MissingSecret)?;
    mac.update(body_b64.as_bytes());
    mac.verify_slice(&expected_sig)
        .map_err(|_| SessionError::BadSignature)?;
    let body = URL_SAFE_NO_PAD
        .decode(body_b64)
        .map_err(|_| SessionError::MalformedToken)?;
    serde_json::from_slice(&body).map_err(|_| SessionError::MalformedToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> SessionIssuer {
        SessionIssuer::new(
            "https://api.github.com".into(),
            Secret::new("x".repeat(32)),
            3_600_000,
            std::collections::HashSet::from(["42".to_string()]),
        )
    }

    #[test]
    fn mint_then_verify_round_trips() {
        let issuer = issuer();
        let user = UserIdentity {
            account_id: AccountId::parse("42").unwrap(),
            login: "octocat".into(),
            avatar_url: "https://example.com/a.png".into(),
            roles: vec![],
        };
        let ticket = issuer.mint(user).unwrap();
        let verified = issuer.verify(&ticket.token).unwrap();
        assert_eq!(verified.account_id.as_str(), "42");
        assert_eq!(verified.login, "octocat");
        assert!(verified.is_moderator());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let issuer = issuer();
        let user = UserIdentity {
            account_id: AccountId::parse("7").unwrap(),
            login: "mallory".into(),
            avatar_url: "https://example.com/b.png".into(),
            roles: vec![],
        };
        let mut ticket = issuer.mint(user).unwrap().token;
        ticket.push('x');
        assert!(matches!(issuer.verify(&ticket), Err(SessionError::BadSignature | SessionError::MalformedToken)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = SessionIssuer::new(
            "https://api.github.com".into(),
            Secret::new("y".repeat(32)),
            0,
            Default::default(),
        );
        let user = UserIdentity {
            account_id: AccountId::parse("1").unwrap(),
            login: "a".into(),
            avatar_url: "https://example.com/c.png".into(),
            roles: vec![],
        };
        let ticket = issuer.mint(user).unwrap();
        assert!(matches!(issuer.verify(&ticket.token), Err(SessionError::Expired)));
    }

    #[test]
    fn short_secret_is_rejected_at_mint() {
        let issuer = SessionIssuer::new(
            "https://api.github.com".into(),
            Secret::new("short".into()),
            3_600_000,
            Default::default(),
        );
        let user = UserIdentity {
            account_id: AccountId::parse("1").unwrap(),
            login: "a".into(),
            avatar_url: "https://example.com/c.png".into(),
            roles: vec![],
        };
        assert!(matches!(issuer.mint(user), Err(SessionError::MissingSecret)));
    }
}
