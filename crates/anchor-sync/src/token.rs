//! Cloud service credentials.
//!
//! A [`TokenProvider`] produces short-lived credentials; the [`TokenManager`]
//! caches the current one and serializes regeneration so that concurrent
//! callers never trigger more than one refresh for the same rejected token.
//!
//! [`SignedTokenProvider`] issues HS256 compact JWS tokens from a service key
//! file:
//!
//! ```json
//! { "client_email": "anchors@example.iam", "key_id": "k1", "secret": "<base64>" }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::error::{AnchorError, AnchorResult};
use crate::time::Clock;

/// Token provider failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Key material could not be read
    #[error("Failed to read service key: {0}")]
    KeyUnavailable(String),

    /// Key material is malformed
    #[error("Invalid service key: {0}")]
    InvalidKey(String),

    /// Signing or encoding failed
    #[error("Failed to sign token: {0}")]
    Signing(String),
}

impl From<TokenError> for AnchorError {
    fn from(err: TokenError) -> Self {
        AnchorError::token(err.to_string())
    }
}

/// Short-lived cloud credential.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    value: Zeroizing<String>,
    expires_at_ms: Option<u64>,
}

impl AuthToken {
    /// Token that never expires
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            expires_at_ms: None,
        }
    }

    /// Token that expires at `expires_at_ms` (Unix epoch milliseconds)
    pub fn expiring(value: impl Into<String>, expires_at_ms: u64) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            expires_at_ms: Some(expires_at_ms),
        }
    }

    /// Credential string
    pub fn value(&self) -> &str {
        self.value.as_str()
    }

    /// Expiry, if bounded
    pub fn expires_at_ms(&self) -> Option<u64> {
        self.expires_at_ms
    }

    /// Whether the token is expired or expires within `margin`
    pub fn is_stale(&self, now_ms: u64, margin: Duration) -> bool {
        match self.expires_at_ms {
            Some(expires) => {
                let margin_ms: u64 = margin.as_millis().try_into().unwrap_or(u64::MAX);
                now_ms.saturating_add(margin_ms) >= expires
            }
            None => false,
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// Produces cloud credentials.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Generate a fresh token
    async fn generate_token(&self) -> Result<AuthToken, TokenError>;
}

/// Provider returning a fixed credential.
pub struct StaticTokenProvider {
    token: AuthToken,
}

impl StaticTokenProvider {
    /// Wrap a fixed credential
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            token: AuthToken::new(value),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn generate_token(&self) -> Result<AuthToken, TokenError> {
        Ok(self.token.clone())
    }
}

#[derive(Deserialize)]
struct ServiceKeyFile {
    client_email: String,
    key_id: String,
    secret: String,
}

/// Service key used to sign tokens.
#[derive(Clone)]
pub struct ServiceKey {
    /// Issuer and subject of issued tokens
    pub client_email: String,
    /// Key identifier placed in the token header
    pub key_id: String,
    /// Base64 signing secret
    secret: Zeroizing<String>,
}

impl ServiceKey {
    /// Build a key from its parts
    pub fn new(
        client_email: impl Into<String>,
        key_id: impl Into<String>,
        secret_b64: impl Into<String>,
    ) -> Self {
        Self {
            client_email: client_email.into(),
            key_id: key_id.into(),
            secret: Zeroizing::new(secret_b64.into()),
        }
    }

    /// Load a key from a JSON key file
    pub async fn load(path: &Path) -> Result<Self, TokenError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TokenError::KeyUnavailable(format!("{}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    /// Parse a key from JSON
    pub fn from_json(content: &str) -> Result<Self, TokenError> {
        let file: ServiceKeyFile =
            serde_json::from_str(content).map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let key = ServiceKey::new(file.client_email, file.key_id, file.secret);
        if key.client_email.is_empty() {
            return Err(TokenError::InvalidKey("client_email is empty".to_string()));
        }
        key.secret_bytes()?;
        Ok(key)
    }

    fn secret_bytes(&self) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        let bytes = STANDARD
            .decode(self.secret.as_bytes())
            .map_err(|e| TokenError::InvalidKey(format!("secret is not base64: {e}")))?;
        if bytes.is_empty() {
            return Err(TokenError::InvalidKey("secret is empty".to_string()));
        }
        Ok(Zeroizing::new(bytes))
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceKey")
            .field("client_email", &self.client_email)
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize)]
struct TokenHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: u64,
    exp: u64,
}

/// Issues HS256-signed tokens from a [`ServiceKey`].
pub struct SignedTokenProvider {
    key: ServiceKey,
    audience: String,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl SignedTokenProvider {
    /// Create a provider for `audience` issuing tokens valid for `lifetime`
    pub fn new(
        key: ServiceKey,
        audience: impl Into<String>,
        lifetime: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key,
            audience: audience.into(),
            lifetime,
            clock,
        }
    }

    fn sign(&self) -> Result<AuthToken, TokenError> {
        let now_ms = self.clock.now_ms();
        let iat = now_ms / 1000;
        let exp = iat.saturating_add(self.lifetime.as_secs());

        let header = TokenHeader {
            alg: "HS256",
            typ: "JWT",
            kid: &self.key.key_id,
        };
        let claims = TokenClaims {
            iss: self.key.client_email.clone(),
            sub: self.key.client_email.clone(),
            aud: self.audience.clone(),
            iat,
            exp,
        };

        let header_json =
            serde_json::to_vec(&header).map_err(|e| TokenError::Signing(e.to_string()))?;
        let claims_json =
            serde_json::to_vec(&claims).map_err(|e| TokenError::Signing(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );

        let secret = self.key.secret_bytes()?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&secret)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(AuthToken::expiring(
            format!("{signing_input}.{signature}"),
            exp.saturating_mul(1000),
        ))
    }
}

#[async_trait]
impl TokenProvider for SignedTokenProvider {
    async fn generate_token(&self) -> Result<AuthToken, TokenError> {
        self.sign()
    }
}

/// Signs tokens with a key read from disk on every generation.
///
/// A missing or malformed key file surfaces when cloud mode starts rather
/// than when the engine is built.
pub struct KeyFileTokenProvider {
    path: PathBuf,
    audience: String,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl KeyFileTokenProvider {
    /// Create a provider reading its key from `path`
    pub fn new(
        path: impl Into<PathBuf>,
        audience: impl Into<String>,
        lifetime: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            path: path.into(),
            audience: audience.into(),
            lifetime,
            clock,
        }
    }
}

#[async_trait]
impl TokenProvider for KeyFileTokenProvider {
    async fn generate_token(&self) -> Result<AuthToken, TokenError> {
        let key = ServiceKey::load(&self.path).await?;
        SignedTokenProvider::new(key, self.audience.clone(), self.lifetime, self.clock.clone())
            .sign()
    }
}

/// Caches the current token and serializes refreshes.
pub struct TokenManager {
    provider: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
    cached: Mutex<Option<AuthToken>>,
    generated: AtomicU64,
}

impl TokenManager {
    /// Create a manager around `provider`
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        clock: Arc<dyn Clock>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            provider,
            clock,
            refresh_margin,
            cached: Mutex::new(None),
            generated: AtomicU64::new(0),
        }
    }

    /// Current token, generating one if none is cached or the cached one is stale
    pub async fn current_token(&self) -> AnchorResult<AuthToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.is_stale(self.clock.now_ms(), self.refresh_margin) {
                return Ok(token.clone());
            }
            tracing::debug!("Cached cloud token is stale, regenerating");
        }
        let token = self.generate().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Replace a token the cloud service rejected.
    ///
    /// If another caller already replaced `rejected`, the newer token is
    /// returned without generating again.
    pub async fn refresh(&self, rejected: Option<&AuthToken>) -> AnchorResult<AuthToken> {
        let mut cached = self.cached.lock().await;
        if let (Some(current), Some(rejected)) = (cached.as_ref(), rejected) {
            if current != rejected && !current.is_stale(self.clock.now_ms(), self.refresh_margin) {
                return Ok(current.clone());
            }
        }
        let token = match self.generate().await {
            Ok(token) => token,
            Err(err) => {
                *cached = None;
                return Err(err);
            }
        };
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Number of tokens generated so far
    pub fn generated_count(&self) -> u64 {
        self.generated.load(Ordering::SeqCst)
    }

    async fn generate(&self) -> AnchorResult<AuthToken> {
        let token = self.provider.generate_token().await.map_err(|e| {
            tracing::warn!(error = %e, "Token generation failed");
            AnchorError::from(e)
        })?;
        self.generated.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(expires_at_ms = ?token.expires_at_ms(), "Generated cloud token");
        Ok(token)
    }
}
