//! Propagation of trace context and correlation ids through outbox headers.
//!
//! The write path captures the current propagation context into the outbox
//! row's headers ([`build_headers`]). The relay restores it when it
//! publishes the row ([`delivery_span`]), so the publish span is parented
//! on the request that created the row rather than on the relay's tick.
//! Consumers recover the correlation id from the broker record's headers
//! ([`correlation_from_record`]).
//!
//! Uses the W3C Trace Context format (`traceparent`/`tracestate`) via the
//! process-wide propagator installed by [`init_propagator`].

use std::collections::HashMap;

use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use rdkafka::message::{Headers as _, Message};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::message::OutboxMessage;

/// Header carrying the correlation id across process boundaries.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Installs the W3C trace-context propagator as the process-wide default.
/// Called once at startup.
pub fn init_propagator() {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
}

/// Serializes the current span's trace context, plus the correlation id if
/// one is known, into a header map suitable for an outbox row.
pub fn build_headers(correlation_id: Option<&str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    let cx = tracing::Span::current().context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut headers);
    });

    if let Some(id) = correlation_id {
        headers.insert(CORRELATION_HEADER.to_owned(), id.to_owned());
    }

    headers
}

/// Restores the propagation context carried in stored headers.
pub fn extract_context(headers: &HashMap<String, String>) -> Context {
    opentelemetry::global::get_text_map_propagator(|propagator| propagator.extract(headers))
}

/// Builds the span a publisher task runs under: a child of the trace
/// context recorded in the row's headers, not of the relay tick.
pub fn delivery_span(msg: &OutboxMessage) -> tracing::Span {
    let span = tracing::info_span!(
        "outbox.publish",
        outbox_msg_id = %msg.id,
        topic = %msg.topic,
        correlation_id = tracing::field::Empty,
    );

    let cx = extract_context(&msg.headers);
    if cx.span().span_context().is_valid() {
        span.set_parent(cx);
    }
    if let Some(id) = msg.headers.get(CORRELATION_HEADER) {
        span.record("correlation_id", id.as_str());
    }

    span
}

/// Correlation id carried in a broker record's headers, if any.
pub fn correlation_from_record<M: Message>(record: &M) -> Option<String> {
    let headers = record.headers()?;
    headers
        .iter()
        .find(|header| header.key == CORRELATION_HEADER)
        .and_then(|header| header.value)
        .map(|value| String::from_utf8_lossy(value).into_owned())
}
