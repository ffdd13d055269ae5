//! Coordinated direct client
//!
//! The handle a direct procedure sends requests through. Every request:
//!
//! 1. is resolved against the run target
//! 2. waits for any recorded rate-limit window
//! 3. gets auth headers/cookies and the CSRF token injected
//! 4. updates `last_response`, the stored CSRF token and the resume instant
//!
//! A token rejection triggers exactly one refresh and one retry. A second
//! rejection is returned as [`StepError::Authorization`].

use super::{CsrfCoordinator, RateLimitCoordinator};
use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::transport::{self, DirectRequest, DirectResponse, DirectSession};

/// Request handle scoped to one step
pub struct DirectClient<'a> {
    session: &'a mut dyn DirectSession,
    context: &'a mut ExecutionContext,
    csrf: Option<&'a CsrfCoordinator>,
    rate_limit: Option<&'a RateLimitCoordinator>,
    sent: usize,
}

impl<'a> DirectClient<'a> {
    /// Create client without coordinators
    #[must_use]
    pub fn new(session: &'a mut dyn DirectSession, context: &'a mut ExecutionContext) -> Self {
        Self {
            session,
            context,
            csrf: None,
            rate_limit: None,
            sent: 0,
        }
    }

    /// With CSRF coordinator
    #[inline]
    #[must_use]
    pub fn with_csrf(mut self, csrf: Option<&'a CsrfCoordinator>) -> Self {
        self.csrf = csrf;
        self
    }

    /// With rate-limit coordinator
    #[inline]
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: Option<&'a RateLimitCoordinator>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Run context
    #[inline]
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &*self.context
    }

    /// Run context, mutable
    #[inline]
    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut *self.context
    }

    /// Requests put on the wire so far, refreshes and retries included
    #[inline]
    #[must_use]
    pub fn requests_sent(&self) -> usize {
        self.sent
    }

    /// Send a request through the coordinators
    pub async fn send(&mut self, request: DirectRequest) -> Result<DirectResponse, StepError> {
        let mut request = request;
        request.url = transport::resolve_url(self.context.target(), &request.url);

        let response = self.dispatch(&request).await?;
        let Some(csrf) = self.csrf else {
            return Ok(response);
        };
        if !(csrf.requires_token(request.method) && csrf.is_protocol_failure(response.status)) {
            return Ok(response);
        }

        tracing::debug!(status = response.status, url = %request.url, "csrf rejection, refreshing token");
        self.refresh(csrf).await?;
        let retried = self.dispatch(&request).await?;
        if csrf.is_protocol_failure(retried.status) {
            tracing::warn!(status = retried.status, url = %request.url, "csrf retry rejected");
            return Err(StepError::Authorization {
                status: retried.status,
            });
        }
        Ok(retried)
    }

    /// Extraction-only call to the refresh endpoint
    async fn refresh(&mut self, csrf: &CsrfCoordinator) -> Result<(), StepError> {
        let refresh = DirectRequest::get(csrf.refresh_url(self.context.target()));
        let response = self.dispatch(&refresh).await?;
        if !csrf.refresh_from(&response, self.context) {
            tracing::debug!(status = response.status, "refresh returned no csrf token");
        }
        Ok(())
    }

    /// One logical send, with throttled re-sends
    async fn dispatch(&mut self, request: &DirectRequest) -> Result<DirectResponse, StepError> {
        let mut throttled = 0;
        loop {
            if let Some(rate_limit) = self.rate_limit {
                rate_limit.wait(self.context).await;
            }
            let prepared = self.prepare(request);
            let response = self.session.send(&prepared).await?;
            self.sent += 1;
            self.observe(&response);

            let retry = self.rate_limit.is_some_and(|rl| {
                rl.is_throttled(response.status) && throttled < rl.config().max_retries
            });
            if !retry {
                return Ok(response);
            }
            throttled += 1;
        }
    }

    fn prepare(&self, request: &DirectRequest) -> DirectRequest {
        let mut prepared = request.clone();
        for (name, value) in self.context.auth_headers().iter() {
            if !prepared.headers.contains(name) {
                prepared.headers.insert(name, value);
            }
        }
        for (name, value) in self.context.auth_cookies() {
            prepared
                .cookies
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        if let Some(csrf) = self.csrf {
            csrf.inject(&mut prepared, &*self.context);
        }
        prepared
    }

    fn observe(&mut self, response: &DirectResponse) {
        self.context.set_last_response(response.meta());
        if let Some(csrf) = self.csrf {
            csrf.observe(response, self.context);
        }
        if let Some(rate_limit) = self.rate_limit {
            rate_limit.observe(response, self.context);
        }
    }
}

impl std::fmt::Debug for DirectClient<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectClient")
            .field("target", &self.context.target())
            .field("csrf", &self.csrf.is_some())
            .field("rate_limit", &self.rate_limit.is_some())
            .field("sent", &self.sent)
            .finish()
    }
}
