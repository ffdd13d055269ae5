//! Authentication collaborators
//!
//! Direct runs pull headers and cookies once at setup and the direct client
//! injects them into every request. Interactive runs get any cookies set on
//! the session first, then `authenticate` is called.

use crate::error::AuthError;
use crate::transport::{Headers, InteractiveSession};
use std::collections::BTreeMap;

/// Authentication mechanism
#[async_trait::async_trait]
pub trait Authentication: Send + Sync + std::fmt::Debug {
    /// Mechanism name for logs and errors
    fn name(&self) -> &str;

    /// Authenticate an interactive session against `target`
    ///
    /// # Returns
    /// `Ok(false)` when the target rejected the credentials
    async fn authenticate(
        &self,
        session: &mut dyn InteractiveSession,
        target: &str,
    ) -> Result<bool, AuthError>;

    /// Headers for direct requests
    async fn auth_headers(&self) -> Result<Headers, AuthError> {
        Ok(Headers::new())
    }

    /// Cookies for direct requests and hybrid interactive sessions
    async fn auth_cookies(&self) -> Result<BTreeMap<String, String>, AuthError> {
        Ok(BTreeMap::new())
    }
}

/// `Authorization: <prefix> <token>` header
#[derive(Debug, Clone)]
pub struct BearerTokenAuth {
    token: String,
    prefix: String,
    header: String,
}

impl BearerTokenAuth {
    /// Create bearer auth with the standard header and prefix
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            prefix: "Bearer".to_string(),
            header: "Authorization".to_string(),
        }
    }

    /// With custom prefix (`Token`, `JWT`, ...)
    #[inline]
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// With custom header name
    #[inline]
    #[must_use]
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }
}

#[async_trait::async_trait]
impl Authentication for BearerTokenAuth {
    fn name(&self) -> &str {
        "bearer-token"
    }

    async fn authenticate(
        &self,
        _session: &mut dyn InteractiveSession,
        _target: &str,
    ) -> Result<bool, AuthError> {
        Err(AuthError::Invalid(
            "bearer token authentication applies to DIRECT mode only".to_string(),
        ))
    }

    async fn auth_headers(&self) -> Result<Headers, AuthError> {
        let value = if self.prefix.is_empty() {
            self.token.clone()
        } else {
            format!("{} {}", self.prefix, self.token)
        };
        Ok([(self.header.as_str(), value)].into_iter().collect())
    }
}

/// Fixed headers and cookies
///
/// In interactive mode the executor sets the cookies on the target's domain
/// before `authenticate` runs.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    headers: Headers,
    cookies: BTreeMap<String, String>,
}

impl StaticAuth {
    /// Create empty static auth
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With header
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// With cookie
    #[inline]
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }
}

#[async_trait::async_trait]
impl Authentication for StaticAuth {
    fn name(&self) -> &str {
        "static"
    }

    /// Cookies are already on the session; a page load confirms they stick
    async fn authenticate(
        &self,
        session: &mut dyn InteractiveSession,
        target: &str,
    ) -> Result<bool, AuthError> {
        if !self.cookies.is_empty() {
            session.navigate(target).await?;
        }
        Ok(true)
    }

    async fn auth_headers(&self) -> Result<Headers, AuthError> {
        Ok(self.headers.clone())
    }

    async fn auth_cookies(&self) -> Result<BTreeMap<String, String>, AuthError> {
        Ok(self.cookies.clone())
    }
}
