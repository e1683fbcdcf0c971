#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sphere_domain::{Identity, UserId};
use thiserror::Error;

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("invalid token format")]
	Format,
	#[error("invalid token encoding")]
	Encoding,
	#[error("invalid token signature")]
	Signature,
	#[error("invalid token claims: {0}")]
	Claims(String),
	#[error("token expired")]
	Expired,
	#[error("invalid signing key")]
	Key,
}

/// Claims carried by a user token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub name: String,
	pub exp: u64,
}

impl AuthClaims {
	pub fn into_identity(self) -> Result<Identity, AuthError> {
		let user_id = UserId::new(self.sub).map_err(|e| AuthError::Claims(e.to_string()))?;
		Ok(Identity::new(user_id, self.name))
	}
}

/// Verify a `v1.<payload>.<signature>` token and return its claims.
pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let mut parts = token.trim().split('.');
	let (Some(version), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(AuthError::Format);
	};
	if version != TOKEN_VERSION {
		return Err(AuthError::Format);
	}

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Encoding)?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Encoding)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::Signature);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|e| AuthError::Claims(e.to_string()))?;
	if claims.exp <= unix_now() {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Mint a token for `claims`. Used by the identity service and tests.
pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> Result<String, AuthError> {
	let payload = serde_json::to_vec(claims).map_err(|e| AuthError::Claims(e.to_string()))?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

pub fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| AuthError::Key)?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Credentials presented when a connection opens.
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
	pub token: Option<String>,
}

impl ConnectContext {
	pub fn with_token(token: impl Into<String>) -> Self {
		Self {
			token: Some(token.into()),
		}
	}
}

/// Maps connect credentials to an identity. `Ok(None)` means no credentials were given.
pub trait IdentityResolver: Send + Sync {
	fn resolve(&self, ctx: &ConnectContext) -> Result<Option<Identity>, AuthError>;
}

#[derive(Debug, Clone)]
pub struct HmacIdentityResolver {
	secret: String,
}

impl HmacIdentityResolver {
	pub fn new(secret: impl Into<String>) -> Self {
		Self { secret: secret.into() }
	}
}

impl IdentityResolver for HmacIdentityResolver {
	fn resolve(&self, ctx: &ConnectContext) -> Result<Option<Identity>, AuthError> {
		let Some(token) = ctx.token.as_deref().filter(|t| !t.trim().is_empty()) else {
			return Ok(None);
		};

		let claims = verify_hmac_token(token, &self.secret)?;
		claims.into_identity().map(Some)
	}
}

/// Resolver for deployments without a signing secret: every connection is anonymous,
/// and any presented token is refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousResolver;

impl IdentityResolver for AnonymousResolver {
	fn resolve(&self, ctx: &ConnectContext) -> Result<Option<Identity>, AuthError> {
		match ctx.token.as_deref().filter(|t| !t.trim().is_empty()) {
			Some(_) => Err(AuthError::Key),
			None => Ok(None),
		}
	}
}
