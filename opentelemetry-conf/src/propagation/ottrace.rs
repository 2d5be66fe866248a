use std::sync::OnceLock;

use opentelemetry::{
    baggage::BaggageExt,
    propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context, KeyValue,
};

const TRACE_ID_HEADER: &str = "ot-tracer-traceid";
const SPAN_ID_HEADER: &str = "ot-tracer-spanid";
const SAMPLED_HEADER: &str = "ot-tracer-sampled";
const BAGGAGE_PREFIX: &str = "ot-baggage-";

fn ottrace_fields() -> &'static [String; 3] {
    static FIELDS: OnceLock<[String; 3]> = OnceLock::new();
    FIELDS.get_or_init(|| {
        [
            TRACE_ID_HEADER.to_owned(),
            SPAN_ID_HEADER.to_owned(),
            SAMPLED_HEADER.to_owned(),
        ]
    })
}

/// Propagates span context and baggage using the OpenTracing `ot-tracer-*`
/// and `ot-baggage-*` headers.
///
/// Trace ids are injected as their low 64 bits; 64-bit ids are left padded
/// on extraction.
#[derive(Clone, Debug, Default)]
pub struct OtTracePropagator {
    _private: (),
}

impl OtTracePropagator {
    pub fn new() -> Self {
        OtTracePropagator::default()
    }

    fn extract_span_context(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let trace_id = extractor.get(TRACE_ID_HEADER)?.trim().to_owned();
        let trace_id = match trace_id.len() {
            16 => TraceId::from_hex(&format!("{trace_id:0>32}")).ok()?,
            32 => TraceId::from_hex(&trace_id).ok()?,
            _ => return None,
        };
        let span_id = extractor.get(SPAN_ID_HEADER)?.trim().to_owned();
        if span_id.len() != 16 {
            return None;
        }
        let span_id = SpanId::from_hex(&span_id).ok()?;
        let flags = match extractor.get(SAMPLED_HEADER).as_deref().map(str::trim) {
            Some("true") | Some("1") => TraceFlags::SAMPLED,
            Some("false") | Some("0") => TraceFlags::default(),
            _ => return None,
        };

        let span_context = SpanContext::new(trace_id, span_id, flags, true, TraceState::default());
        span_context.is_valid().then_some(span_context)
    }
}

impl TextMapPropagator for OtTracePropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        let span_context = span.span_context();
        if !span_context.is_valid() {
            return;
        }
        let trace_id = span_context.trace_id().to_string();
        injector.set(TRACE_ID_HEADER, trace_id[16..].to_string());
        injector.set(SPAN_ID_HEADER, span_context.span_id().to_string());
        injector.set(SAMPLED_HEADER, span_context.is_sampled().to_string());

        for (key, (value, _)) in cx.baggage() {
            injector.set(&format!("{BAGGAGE_PREFIX}{key}"), value.to_string());
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let Some(span_context) = self.extract_span_context(extractor) else {
            return cx.clone();
        };

        let baggage: Vec<KeyValue> = extractor
            .keys()
            .into_iter()
            .filter_map(|key| {
                let name = key.strip_prefix(BAGGAGE_PREFIX)?;
                let value = extractor.get(&key)?;
                Some(KeyValue::new(name.to_string(), value.to_string()))
            })
            .collect();

        let cx = cx.with_remote_span_context(span_context);
        if baggage.is_empty() {
            cx
        } else {
            cx.with_baggage(baggage)
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(ottrace_fields())
    }
}
