//! Execution context
//!
//! Run-scoped mutable state. One context is owned by exactly one run; the
//! only thing replications share is the read-only proxy/credential
//! [`Assignment`], held behind an `Arc`.

use crate::orchestration::Assignment;
use crate::transport::{Headers, ResponseMeta};
use crate::types::ExecutionMode;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;

/// Mutable bag of run-scoped state
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    mode: ExecutionMode,
    target: String,
    replication: Option<usize>,
    assignment: Option<Arc<Assignment>>,
    auth_headers: Headers,
    auth_cookies: BTreeMap<String, String>,
    csrf_token: Option<String>,
    rate_limit_resume_at: Option<Instant>,
    last_response: Option<ResponseMeta>,
    values: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    /// Create context; `mode` is fixed for the lifetime of the context
    #[must_use]
    pub fn new(mode: ExecutionMode, target: impl Into<String>) -> Self {
        Self {
            mode,
            target: target.into(),
            replication: None,
            assignment: None,
            auth_headers: Headers::new(),
            auth_cookies: BTreeMap::new(),
            csrf_token: None,
            rate_limit_resume_at: None,
            last_response: None,
            values: HashMap::new(),
        }
    }

    /// With replication index
    #[inline]
    #[must_use]
    pub fn with_replication(mut self, index: usize) -> Self {
        self.replication = Some(index);
        self
    }

    /// With proxy/credential assignment
    #[inline]
    #[must_use]
    pub fn with_assignment(mut self, assignment: Arc<Assignment>) -> Self {
        self.assignment = Some(assignment);
        self
    }

    /// Transport mode
    #[inline]
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Base target address
    #[inline]
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Replication index when orchestrated
    #[inline]
    #[must_use]
    pub fn replication(&self) -> Option<usize> {
        self.replication
    }

    /// Proxy/credential assignment when distributed
    #[inline]
    #[must_use]
    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_deref()
    }

    /// Headers injected into every direct request
    #[inline]
    #[must_use]
    pub fn auth_headers(&self) -> &Headers {
        &self.auth_headers
    }

    /// Merge authentication headers
    pub fn add_auth_headers<I, K, V>(&mut self, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (k, v) in headers {
            self.auth_headers.insert(k, v);
        }
    }

    /// Cookies injected into every direct request
    #[inline]
    #[must_use]
    pub fn auth_cookies(&self) -> &BTreeMap<String, String> {
        &self.auth_cookies
    }

    /// Merge authentication cookies
    pub fn add_auth_cookies<I, K, V>(&mut self, cookies: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in cookies {
            self.auth_cookies.insert(k.into(), v.into());
        }
    }

    /// Stored CSRF token
    #[inline]
    #[must_use]
    pub fn csrf_token(&self) -> Option<&str> {
        self.csrf_token.as_deref()
    }

    /// Overwrite stored CSRF token
    #[inline]
    pub fn set_csrf_token(&mut self, token: impl Into<String>) {
        self.csrf_token = Some(token.into());
    }

    /// Instant before which no call may start
    #[inline]
    #[must_use]
    pub fn rate_limit_resume_at(&self) -> Option<Instant> {
        self.rate_limit_resume_at
    }

    /// Record a resume instant; an earlier hint never shortens a later one
    pub fn record_resume_at(&mut self, at: Instant) {
        self.rate_limit_resume_at = Some(match self.rate_limit_resume_at {
            Some(existing) if existing > at => existing,
            _ => at,
        });
    }

    /// Forget an elapsed resume instant
    #[inline]
    pub fn clear_resume_at(&mut self) {
        self.rate_limit_resume_at = None;
    }

    /// Last direct response metadata
    #[inline]
    #[must_use]
    pub fn last_response(&self) -> Option<&ResponseMeta> {
        self.last_response.as_ref()
    }

    /// Record last direct response metadata
    #[inline]
    pub fn set_last_response(&mut self, meta: ResponseMeta) {
        self.last_response = Some(meta);
    }

    /// Procedure-specific named value
    #[inline]
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Set procedure-specific named value
    #[inline]
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn context_builder() {
        let ctx = ExecutionContext::new(ExecutionMode::Direct, "https://app.test").with_replication(3);
        assert_eq!(ctx.mode(), ExecutionMode::Direct);
        assert_eq!(ctx.target(), "https://app.test");
        assert_eq!(ctx.replication(), Some(3));
        assert!(ctx.assignment().is_none());
    }

    #[test]
    fn auth_material_merges() {
        let mut ctx = ExecutionContext::new(ExecutionMode::Direct, "https://app.test");
        ctx.add_auth_headers([("Authorization", "Bearer a")]);
        ctx.add_auth_headers([("authorization", "Bearer b")]);
        ctx.add_auth_cookies([("session", "s1")]);
        assert_eq!(ctx.auth_headers().get("Authorization"), Some("Bearer b"));
        assert_eq!(ctx.auth_cookies().get("session").map(String::as_str), Some("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_at_keeps_latest() {
        let mut ctx = ExecutionContext::new(ExecutionMode::Direct, "https://app.test");
        let now = Instant::now();
        ctx.record_resume_at(now + Duration::from_secs(10));
        ctx.record_resume_at(now + Duration::from_secs(2));
        assert_eq!(ctx.rate_limit_resume_at(), Some(now + Duration::from_secs(10)));
        ctx.clear_resume_at();
        assert!(ctx.rate_limit_resume_at().is_none());
    }

    #[test]
    fn named_values() {
        let mut ctx = ExecutionContext::new(ExecutionMode::Interactive, "https://app.test");
        ctx.set_value("username", "admin");
        assert_eq!(ctx.value("username").and_then(|v| v.as_str()), Some("admin"));
    }
}
