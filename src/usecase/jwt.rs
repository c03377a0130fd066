use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Role the backend puts into tokens of signed-in users.
pub const AUTHENTICATED_ROLE: &str = "authenticated";

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Failed to validate token: {0}")]
    TokenValidationError(String),
    #[error("Token expired")]
    TokenExpired,
    #[error("Token does not belong to a signed-in user")]
    NotAuthenticated,
}

/// Access token claims as issued by the backend's auth service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Clone)]
pub struct JwtService {
    secret: String,
}

impl JwtService {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Verifies signature and expiry and requires the authenticated role.
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = jsonwebtoken::Validation::default();
        validation.validate_exp = true;
        validation.validate_aud = false;

        let token_data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
            _ => JwtError::TokenValidationError(e.to_string()),
        })?;

        if token_data.claims.role.as_deref() != Some(AUTHENTICATED_ROLE) {
            return Err(JwtError::NotAuthenticated);
        }

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, role: Option<&str>, exp_offset: i64) -> (Uuid, String) {
        let sub = Uuid::new_v4();
        let claims = Claims {
            sub,
            exp: chrono::Utc::now().timestamp() + exp_offset,
            email: Some("member@example.org".to_string()),
            role: role.map(str::to_string),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        (sub, token)
    }

    #[test]
    fn test_validate_invalid_token() {
        let service = JwtService::new("secret".to_string());
        let result = service.validate_token("invalid.token.here");
        assert!(matches!(result, Err(JwtError::TokenValidationError(_))));
    }

    #[test]
    fn test_validate_signed_in_user() {
        let service = JwtService::new("secret".to_string());
        let (sub, token) = token("secret", Some(AUTHENTICATED_ROLE), 3600);

        let claims = service.validate_token(&token).unwrap();

        assert_eq!(claims.sub, sub);
        assert_eq!(claims.email.as_deref(), Some("member@example.org"));
    }

    #[test]
    fn test_rejects_anonymous_role() {
        let service = JwtService::new("secret".to_string());
        let (_, token) = token("secret", Some("anon"), 3600);

        assert!(matches!(
            service.validate_token(&token),
            Err(JwtError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_rejects_expired_and_foreign_tokens() {
        let service = JwtService::new("secret".to_string());
        let (_, expired) = token("secret", Some(AUTHENTICATED_ROLE), -3600);
        let (_, foreign) = token("other-secret", Some(AUTHENTICATED_ROLE), 3600);

        assert!(matches!(service.validate_token(&expired), Err(JwtError::TokenExpired)));
        assert!(service.validate_token(&foreign).is_err());
    }
}
