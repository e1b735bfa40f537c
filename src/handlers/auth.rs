//! HTTP basic authentication for the telemetry endpoint.
//!
//! Credentials are stored as SHA-256 digests and compared in constant time
//! against every configured user, so the response time does not reveal which
//! part of the credentials was wrong.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::{Choice, ConstantTimeEq};
use tracing::debug;

struct Credential {
    user: [u8; 32],
    password: [u8; 32],
}

fn digest(value: &[u8]) -> [u8; 32] {
    Sha256::digest(value).into()
}

/// Configured users.
pub struct BasicAuth {
    credentials: Vec<Credential>,
}

impl BasicAuth {
    pub fn new(users: &BTreeMap<String, String>) -> Self {
        Self {
            credentials: users
                .iter()
                .map(|(user, password)| Credential {
                    user: digest(user.as_bytes()),
                    password: digest(password.as_bytes()),
                })
                .collect(),
        }
    }

    /// Checks an `Authorization` header value.
    pub fn check(&self, authorization: Option<&str>) -> bool {
        let Some((user, password)) = authorization.and_then(decode_header) else {
            return false;
        };
        let user = digest(user.as_bytes());
        let password = digest(password.as_bytes());

        let mut valid = Choice::from(0);
        for credential in &self.credentials {
            valid |= credential.user.ct_eq(&user) & credential.password.ct_eq(&password);
        }
        valid.into()
    }
}

fn decode_header(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Middleware rejecting requests without valid credentials.
pub async fn require_basic_auth(
    State(auth): State<Arc<BasicAuth>>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if auth.check(authorization) {
        return next.run(request).await;
    }

    debug!("Rejected request to {} without valid credentials", request.uri());
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, r#"Basic realm="restricted""#)],
        "Unauthorized",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
    }

    #[test]
    fn test_check_credentials() {
        let mut users = BTreeMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        users.insert("bob".to_string(), "hunter2".to_string());
        let auth = BasicAuth::new(&users);

        assert!(auth.check(Some(&header_for("alice", "secret"))));
        assert!(auth.check(Some(&header_for("bob", "hunter2"))));
        assert!(!auth.check(Some(&header_for("alice", "hunter2"))));
        assert!(!auth.check(Some(&header_for("carol", "secret"))));
        assert!(!auth.check(Some("Bearer abc")));
        assert!(!auth.check(Some("Basic !!!")));
        assert!(!auth.check(None));
    }

    #[test]
    fn test_password_may_contain_colon() {
        let mut users = BTreeMap::new();
        users.insert("alice".to_string(), "a:b".to_string());
        let auth = BasicAuth::new(&users);
        assert!(auth.check(Some(&header_for("alice", "a:b"))));
    }
}
