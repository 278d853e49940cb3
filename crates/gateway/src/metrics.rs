use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static PIPELINE_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static GATE_REJECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static MODEL_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EXECUTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SCHEMA_LOADS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn counter_vec(
    cell: &'static OnceLock<IntCounterVec>,
    name: &str,
    help: &str,
    labels: &[&str],
) -> &'static IntCounterVec {
    cell.get_or_init(|| {
        register_collector(
            IntCounterVec::new(Opts::new(name, help), labels)
                .expect("static counter definition must be valid"),
        )
    })
}

fn http_requests_total() -> &'static IntCounterVec {
    counter_vec(
        &HTTP_REQUESTS_TOTAL,
        "sqlgate_http_requests_total",
        "Gateway HTTP request count.",
        &["route", "method", "status"],
    )
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "sqlgate_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create sqlgate_http_request_duration_seconds"),
        )
    })
}

fn pipeline_outcomes_total() -> &'static IntCounterVec {
    counter_vec(
        &PIPELINE_OUTCOMES_TOTAL,
        "sqlgate_pipeline_outcomes_total",
        "Pipeline runs by terminal (or suspended) status and error code.",
        &["status", "code"],
    )
}

fn gate_rejections_total() -> &'static IntCounterVec {
    counter_vec(
        &GATE_REJECTIONS_TOTAL,
        "sqlgate_gate_rejections_total",
        "Candidate queries rejected per gate.",
        &["gate"],
    )
}

fn model_calls_total() -> &'static IntCounterVec {
    counter_vec(
        &MODEL_CALLS_TOTAL,
        "sqlgate_model_calls_total",
        "Language model calls by purpose and outcome.",
        &["purpose", "outcome"],
    )
}

fn executions_total() -> &'static IntCounterVec {
    counter_vec(
        &EXECUTIONS_TOTAL,
        "sqlgate_executions_total",
        "Safe executor runs by outcome.",
        &["outcome"],
    )
}

fn schema_loads_total() -> &'static IntCounterVec {
    counter_vec(
        &SCHEMA_LOADS_TOTAL,
        "sqlgate_schema_loads_total",
        "Schema catalog loads from the database by outcome.",
        &["outcome"],
    )
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

/// `code` is empty for runs that did not fail.
pub fn observe_pipeline_outcome(status: &str, code: &str) {
    pipeline_outcomes_total()
        .with_label_values(&[status, code])
        .inc();
}

pub fn observe_gate_rejection(gate: &str) {
    gate_rejections_total().with_label_values(&[gate]).inc();
}

pub fn observe_model_call(purpose: &str, outcome: &str) {
    model_calls_total()
        .with_label_values(&[purpose, outcome])
        .inc();
}

pub fn observe_execution(outcome: &str) {
    executions_total().with_label_values(&[outcome]).inc();
}

pub fn observe_schema_load(outcome: &str) {
    schema_loads_total().with_label_values(&[outcome]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = pipeline_outcomes_total();
    let _ = gate_rejections_total();
    let _ = executions_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_exposition_contains_observed_series() {
        observe_gate_rejection("keyword");
        observe_pipeline_outcome("failed", "GENERATION_FAILED");
        observe_http_request("/v1/chat", "POST", 200, Duration::from_millis(12));

        let (body, content_type) = render().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("sqlgate_gate_rejections_total{gate=\"keyword\"}"));
        assert!(text.contains("code=\"GENERATION_FAILED\""));
        assert!(text.contains("sqlgate_http_request_duration_seconds_bucket"));
    }
}
