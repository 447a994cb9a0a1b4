//! Request spans in the style of Cloud Trace.
//!
//! [`TraceService`] opens `tracing` spans stamped with the service name.
//! Every span is named `operation`; the operation it covers is carried in the
//! `otel.name` field, which `tracing-opentelemetry` exports as the span name.
//! [`RootSpanHook`] gives every named operation a root span that lives in the
//! caller's [`CallContext`] from resolution until the response is sent.
//! Exporting spans is left to whatever subscriber the application installs;
//! [`init_subscriber`] sets up a plain fmt subscriber for services that have none.


use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::Span;
use tracing_subscriber::EnvFilter;

use crate::core::context::CallContext;

/// Operation name GraphQL clients use for schema introspection.
pub const INTROSPECTION_OPERATION: &str = "IntrospectionQuery";

const DEFAULT_FILTER: &str = "info";

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Fails if a global subscriber is already set, which callers may ignore.
pub fn init_subscriber() -> Result<(), TraceError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| TraceError::SubscriberInit(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct TraceService {
    service: String,
}

impl TraceService {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Opens a span for the operation `name`. The `service` field defaults to this
    /// service's name; an explicit `service` attribute replaces it.
    pub fn start_span(&self, name: &str, attributes: &[(&str, &str)]) -> Span {
        let mut extra: BTreeMap<&str, &str> = attributes.iter().copied().collect();
        let service = extra.remove("service").unwrap_or(&self.service);

        let span = tracing::info_span!(
            "operation",
            otel.name = %name,
            service = %service,
            attributes = tracing::field::Empty,
        );
        if !extra.is_empty() {
            span.record("attributes", tracing::field::debug(&extra));
        }
        span
    }
}

/// Opens and closes one root span per resolved operation.
#[derive(Debug, Clone)]
pub struct RootSpanHook {
    trace: Arc<TraceService>,
}

impl RootSpanHook {
    pub fn new(trace: Arc<TraceService>) -> Self {
        Self { trace }
    }

    /// Starts the root span once the operation name is known. Anonymous and
    /// introspection operations are not traced.
    pub fn did_resolve_operation(&self, ctx: &mut CallContext, operation_name: Option<&str>) {
        let Some(name) = operation_name.filter(|name| *name != INTROSPECTION_OPERATION) else {
            return;
        };
        ctx.set_root_span(self.trace.start_span(name, &[]));
    }

    /// Ends the root span, if one was started.
    pub fn will_send_response(&self, ctx: &mut CallContext) {
        // dropping the last handle closes the span
        drop(ctx.take_root_span());
    }
}
