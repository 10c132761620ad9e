use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::AUTHORIZATION;
use reqwest::RequestBuilder;
use sqlx::postgres::PgConnectOptions;
use std::fmt;

/// Credential strategy attached to a retrieval source.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    None,
    Basic { username: String, password: String },
}

impl AuthStrategy {
    /// Build a strategy from the configured `AUTH_TYPE` and credentials.
    ///
    /// `basic` requires both a username and a password; anything missing is
    /// reported as a configuration error naming the setting.
    pub fn from_parts(
        auth_type: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
        prefix: &str,
    ) -> Result<Self> {
        let auth_type = auth_type.map(|t| t.trim().to_ascii_lowercase());

        match auth_type.as_deref() {
            None | Some("") | Some("none") => Ok(AuthStrategy::None),
            // The samples spelled these per backend
            Some("basic") | Some("httpbasic") | Some("sqlbasic") => {
                let username = non_empty(username)
                    .ok_or_else(|| Error::Config(format!("{prefix}_USERNAME is required for basic auth")))?;
                let password = non_empty(password)
                    .ok_or_else(|| Error::Config(format!("{prefix}_PASSWORD is required for basic auth")))?;

                Ok(AuthStrategy::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            Some(other) => Err(Error::Config(format!(
                "unsupported AUTH_TYPE '{other}', expected 'basic' or 'none'"
            ))),
        }
    }

    /// Value of the `Authorization` header, if this strategy sends one.
    pub fn header_value(&self) -> Option<String> {
        match self {
            AuthStrategy::None => None,
            AuthStrategy::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                Some(format!("Basic {encoded}"))
            }
        }
    }

    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self.header_value() {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        }
    }

    pub fn apply_to_pg(&self, options: PgConnectOptions) -> PgConnectOptions {
        match self {
            AuthStrategy::None => options,
            AuthStrategy::Basic { username, password } => {
                options.username(username).password(password)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthStrategy::None => "none",
            AuthStrategy::Basic { .. } => "basic",
        }
    }
}

impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStrategy::None => write!(f, "None"),
            AuthStrategy::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn basic(username: &str, password: &str) -> AuthStrategy {
        AuthStrategy::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn basic_header_is_base64_of_user_colon_password() {
        let expected = format!("Basic {}", STANDARD.encode("u:p"));

        assert_eq!(basic("u", "p").header_value(), Some(expected));
        assert_eq!(basic("u", "p").header_value().as_deref(), Some("Basic dTpw"));
    }

    #[test]
    fn apply_sets_authorization_header() {
        let client = reqwest::Client::new();

        let request = basic("u", "p")
            .apply(client.get("http://localhost/contexts"))
            .build()
            .unwrap();
        assert_eq!(request.headers()[AUTHORIZATION], "Basic dTpw");

        let request = AuthStrategy::None
            .apply(client.get("http://localhost/contexts"))
            .build()
            .unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn basic_requires_both_credentials() {
        let err = AuthStrategy::from_parts(Some("basic"), Some("user"), None, "HTTP").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("HTTP_PASSWORD"));

        let err = AuthStrategy::from_parts(Some("basic"), Some(""), Some("pw"), "SQL").unwrap_err();
        assert!(err.to_string().contains("SQL_USERNAME"));
    }

    #[test]
    fn auth_type_parsing() {
        assert_eq!(
            AuthStrategy::from_parts(None, None, None, "HTTP").unwrap(),
            AuthStrategy::None
        );
        assert_eq!(
            AuthStrategy::from_parts(Some("NONE"), Some("ignored"), None, "HTTP").unwrap(),
            AuthStrategy::None
        );
        assert_eq!(
            AuthStrategy::from_parts(Some("HttpBasic"), Some("u"), Some("p"), "HTTP").unwrap(),
            basic("u", "p")
        );
        assert!(AuthStrategy::from_parts(Some("oauth"), None, None, "HTTP").is_err());
    }

    #[test]
    fn debug_output_hides_password() {
        let rendered = format!("{:?}", basic("admin", "s3cret"));
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("s3cret"));
    }
}
