// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Propagation over AMQP Headers
//!
//! Trace context travels in AMQP message headers. Every delivery is handled
//! inside a consumer span parented to the publisher's context, and the copy
//! sent to the dead-letter queue carries the consumer span onward, so a trace
//! follows a message from its publisher to the DLQ.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Name of the tracer used for message consumption spans.
pub const TRACER_NAME: &str = "amqp consumer";

/// Reads and writes OpenTelemetry context entries in an AMQP header table.
///
/// Keys are stored lowercased and values as AMQP long strings; entries of any
/// other type are invisible to extraction.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Wraps the header table of a delivered or outgoing message.
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Stores one propagation entry (`traceparent`, `tracestate`...) as a header.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Looks up a propagation entry. Non-string or non-UTF-8 headers yield `None`.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Starts the consumer span of a delivery.
///
/// The span is parented to the context extracted from the message headers, and
/// the returned context holds it as its active span: recording on the span and
/// propagating it downstream both go through that context.
pub fn consumer_context(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> Context {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|h| h.inner().clone())
        .unwrap_or_default();

    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &parent);

    parent.with_span(span)
}

/// Writes `cx` into an outgoing header table with the global propagator.
pub fn inject_context(cx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut RabbitMQTracePropagator::new(headers))
    });
}
