use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access and refresh token issued by the login, registration and refresh endpoints.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

/// Read the `exp` claim of a JWT without verifying its signature.
///
/// Returns `None` for opaque tokens or tokens without an expiry.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

/// Whether the token's `exp` claim falls within `window` from now.
pub fn expires_within(token: &str, window: Duration) -> bool {
    match jwt_expiry(token) {
        Some(ts) => Utc::now() + window >= ts,
        None => false,
    }
}

#[cfg(test)]
pub(crate) fn fake_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"user_id":7}}"#));
    format!("{header}.{claims}.signature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_exp_claim() {
        let exp = Utc::now().timestamp() + 60;
        let token = fake_jwt(exp);
        assert_eq!(jwt_expiry(&token).unwrap().timestamp(), exp);
        assert!(expires_within(&token, Duration::minutes(2)));
        assert!(!expires_within(&token, Duration::seconds(5)));
    }

    #[test]
    fn opaque_tokens_have_no_expiry() {
        assert!(jwt_expiry("tok1").is_none());
        assert!(jwt_expiry("a.!!!.c").is_none());
        assert!(!expires_within("tok1", Duration::hours(1)));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let pair = CredentialPair::new("secret-access", "secret-refresh");
        let printed = format!("{pair:?}");
        assert!(!printed.contains("secret"));
    }
}
