use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("jwt secret must be at least {MIN_SECRET_LEN} characters long")]
    WeakSecret,
    #[error("access token is invalid: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("access token subject '{0}' is not a UUID")]
    InvalidSubject(String),
    #[error("system clock is before unix epoch")]
    Clock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    workspace_id: Uuid,
    iat: i64,
    exp: i64,
}

/// Identity proven by a valid access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenIdentity {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
}

/// HS256 access tokens scoped to one workspace.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(secret: &str) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Mint a token. The API service normally issues these; the live server
    /// only needs it for tooling and tests.
    pub fn issue(&self, user_id: Uuid, workspace_id: Uuid) -> Result<String, TokenError> {
        self.issue_at(user_id, workspace_id, unix_now()?)
    }

    fn issue_at(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        issued_at: i64,
    ) -> Result<String, TokenError> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            workspace_id,
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    pub fn verify(&self, token: &str) -> Result<TokenIdentity, TokenError> {
        let claims =
            decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)?.claims;
        let user_id =
            Uuid::parse_str(&claims.sub).map_err(|_| TokenError::InvalidSubject(claims.sub))?;

        Ok(TokenIdentity { user_id, workspace_id: claims.workspace_id })
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn unix_now() -> Result<i64, TokenError> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|_| TokenError::Clock)?;
    i64::try_from(elapsed.as_secs()).map_err(|_| TokenError::Clock)
}
