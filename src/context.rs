//! Request correlation context.
//!
//! Every public orchestrator operation takes a [`RequestContext`] and runs
//! inside its span, so log lines emitted anywhere below (including from the
//! spawned execution task) carry `request_id` and `correlation_id`.

use tracing::Span;
use uuid::Uuid;

/// Correlation identifiers for one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// `req-<uuid>`.
    pub request_id: String,
    /// Caller-supplied id linking related requests. Defaults to `request_id`.
    pub correlation_id: String,
    pub tenant_id: Option<String>,
}

impl RequestContext {
    /// Fresh context with generated ids.
    pub fn new() -> Self {
        let request_id = format!("req-{}", Uuid::new_v4());
        Self {
            correlation_id: request_id.clone(),
            request_id,
            tenant_id: None,
        }
    }

    /// Context continuing an upstream correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Tracing span carrying the correlation fields.
    pub fn span(&self, operation: &'static str) -> Span {
        tracing::info_span!(
            "request",
            operation,
            request_id = %self.request_id,
            correlation_id = %self.correlation_id,
            tenant_id = self.tenant_id.as_deref().unwrap_or("-"),
        )
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
