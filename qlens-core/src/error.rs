//! # Error Taxonomy
//!
//! Every failure in the pipeline is a [`QLensError`] value carrying a
//! classified [`ErrorKind`], a stable machine code, a severity, and a
//! retryability flag. Retryability is decided where the error is
//! constructed, never re-derived at call sites: the orchestrator's failover
//! loop and the adapters' retry policies both consult `error.retryable`
//! and nothing else.
//!
//! Errors split into a public face and an internal one. [`PublicError`]
//! is what clients see: code, type, safe message, request correlation ID,
//! and a whitelisted detail set. Wrapped exceptions, provider payloads, and
//! anything else diagnostic stays in the `internal` field, which is logged
//! but never serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classified failure type. The HTTP status mapping is deterministic per
/// kind; see [`QLensError::http_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    TooManyRequests,
    QuotaExceeded,
    BudgetExceeded,
    Timeout,
    ServiceUnavailable,
    ProviderError,
    ProviderUnavailable,
    ModelUnavailable,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::TooManyRequests => "too_many_requests",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational severity, used for log levels and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Client-safe detail fields. Only these ever reach a response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
}

/// A classified pipeline failure.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct QLensError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
    pub details: ErrorDetails,
    pub severity: Severity,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    internal: Option<String>,
}

impl QLensError {
    fn new(kind: ErrorKind, severity: Severity, retryable: bool, message: String) -> Self {
        Self {
            kind,
            code: kind.as_str(),
            message,
            details: ErrorDetails::default(),
            severity,
            retryable,
            timestamp: Utc::now(),
            request_id: None,
            internal: None,
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Validation, Severity::Low, false, message.into());
        err.details.field = Some(field.into());
        err
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, Severity::Medium, false, message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, Severity::Medium, false, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, Severity::Low, false, message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, Severity::Medium, false, message.into())
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooManyRequests, Severity::Medium, true, message.into())
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, Severity::Medium, false, message.into())
    }

    pub fn budget_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BudgetExceeded, Severity::High, false, message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, Severity::Medium, true, message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, Severity::High, true, message.into())
    }

    pub fn provider_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::ProviderError, Severity::High, true, message.into());
        err.details.provider = Some(provider.into());
        err
    }

    pub fn provider_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(
            ErrorKind::ProviderUnavailable,
            Severity::High,
            true,
            message.into(),
        );
        err.details.provider = Some(provider.into());
        err
    }

    pub fn model_unavailable(model: impl Into<String>) -> Self {
        let model = model.into();
        let mut err = Self::new(
            ErrorKind::ModelUnavailable,
            Severity::Medium,
            false,
            format!("no provider serves model {model}"),
        );
        err.details.model = Some(model);
        err
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, Severity::Critical, false, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, Severity::Critical, false, message.into())
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.details.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.details.provider = Some(provider.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.details.tenant_id = Some(tenant_id.into());
        self
    }

    /// Attach diagnostic context that is logged but never exposed to
    /// clients.
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal = Some(internal.into());
        self
    }

    pub fn internal_detail(&self) -> Option<&str> {
        self.internal.as_deref()
    }

    /// Deterministic HTTP status for this error's kind.
    pub fn http_status(&self) -> u16 {
        match self.kind {
            ErrorKind::Validation => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::BudgetExceeded => 402,
            ErrorKind::Authorization => 403,
            ErrorKind::NotFound | ErrorKind::ModelUnavailable => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::Conflict => 409,
            ErrorKind::TooManyRequests | ErrorKind::QuotaExceeded => 429,
            ErrorKind::ProviderError => 502,
            ErrorKind::ProviderUnavailable | ErrorKind::ServiceUnavailable => 503,
            ErrorKind::Configuration | ErrorKind::Internal => 500,
        }
    }

    /// Client-safe projection of this error.
    pub fn public_error(&self) -> PublicError {
        PublicError {
            code: self.code,
            kind: self.kind,
            message: self.message.clone(),
            details: self.details.clone(),
            request_id: self.request_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// The error shape serialized into HTTP responses. Carries no internal
/// diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PublicError {
    pub code: &'static str,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub details: ErrorDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping_is_deterministic() {
        let cases = [
            (QLensError::validation("model", "missing"), 400),
            (QLensError::authentication("no key"), 401),
            (QLensError::budget_exceeded("over budget"), 402),
            (QLensError::authorization("forbidden"), 403),
            (QLensError::not_found("no such thing"), 404),
            (QLensError::model_unavailable("gpt-5-ultra"), 404),
            (QLensError::timeout("deadline exceeded"), 408),
            (QLensError::conflict("version clash"), 409),
            (QLensError::too_many_requests("throttled"), 429),
            (QLensError::quota_exceeded("quota"), 429),
            (QLensError::internal("boom"), 500),
            (QLensError::configuration("bad config"), 500),
            (QLensError::provider_error("azure-openai", "upstream 500"), 502),
            (QLensError::provider_unavailable("azure-openai", "down"), 503),
            (QLensError::service_unavailable("no providers"), 503),
        ];
        for (err, status) in cases {
            assert_eq!(err.http_status(), status, "kind {:?}", err.kind);
        }
    }

    #[test]
    fn retryability_is_an_attribute() {
        assert!(QLensError::timeout("t").retryable);
        assert!(QLensError::too_many_requests("r").retryable);
        assert!(QLensError::provider_error("p", "m").retryable);
        assert!(QLensError::service_unavailable("s").retryable);
        assert!(!QLensError::validation("f", "m").retryable);
        assert!(!QLensError::model_unavailable("m").retryable);
        assert!(!QLensError::internal("i").retryable);
    }

    #[test]
    fn public_error_never_carries_internal_context() {
        let err = QLensError::provider_error("aws-bedrock", "upstream failure")
            .with_internal("raw provider body: {secret}")
            .with_request_id("req-42");
        let public = err.public_error();
        let json = serde_json::to_string(&public).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("req-42"));
        assert!(json.contains("provider_error"));
    }

    #[test]
    fn validation_error_carries_field() {
        let err = QLensError::validation("temperature", "must be between 0 and 2");
        assert_eq!(err.details.field.as_deref(), Some("temperature"));
        assert_eq!(err.severity, Severity::Low);
    }
}
