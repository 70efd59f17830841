use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

struct Metrics {
    routes: IntCounterVec,
    dedup_joins: IntCounter,
    service_errors: IntCounterVec,
    service_latency: Histogram,
    knowledge_inserts: IntCounterVec,
    knowledge_entries: IntGauge,
    persist_failures: IntCounterVec,
    messages: IntCounterVec,
    active_sessions: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: &C) -> Result<(), prometheus::Error> {
    match REGISTRY.register(Box::new(collector.clone())) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Registers all collectors. Recording functions are no-ops until this runs.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = Metrics {
        routes: IntCounterVec::new(
            prometheus::opts!("aivi_route_total", "Answered queries by resolution"),
            &["outcome"],
        )?,
        dedup_joins: IntCounter::new(
            "aivi_dedup_joins_total",
            "Queries that joined an in-flight generation instead of starting one",
        )?,
        service_errors: IntCounterVec::new(
            prometheus::opts!("aivi_service_errors_total", "Answer service failures by kind"),
            &["kind"],
        )?,
        service_latency: Histogram::with_opts(HistogramOpts::new(
            "aivi_service_latency_seconds",
            "Time spent waiting on the answer service",
        ))?,
        knowledge_inserts: IntCounterVec::new(
            prometheus::opts!("aivi_knowledge_inserts_total", "Knowledge entries added by source"),
            &["source"],
        )?,
        knowledge_entries: IntGauge::new("aivi_knowledge_entries", "Entries in the knowledge store")?,
        persist_failures: IntCounterVec::new(
            prometheus::opts!("aivi_persist_failures_total", "Failed durable writes by store"),
            &["store"],
        )?,
        messages: IntCounterVec::new(
            prometheus::opts!("aivi_messages_total", "Conversation messages recorded by role"),
            &["role"],
        )?,
        active_sessions: IntGauge::new("aivi_active_sessions", "Open conversation sessions")?,
    };

    register(&metrics.routes)?;
    register(&metrics.dedup_joins)?;
    register(&metrics.service_errors)?;
    register(&metrics.service_latency)?;
    register(&metrics.knowledge_inserts)?;
    register(&metrics.knowledge_entries)?;
    register(&metrics.persist_failures)?;
    register(&metrics.messages)?;
    register(&metrics.active_sessions)?;

    let _ = METRICS.set(metrics);
    Ok(())
}

pub fn inc_route(outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.routes.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_dedup_join() {
    if let Some(m) = METRICS.get() {
        m.dedup_joins.inc();
    }
}

pub fn inc_service_error(kind: &str) {
    if let Some(m) = METRICS.get() {
        m.service_errors.with_label_values(&[kind]).inc();
    }
}

pub fn observe_service_latency(seconds: f64) {
    if let Some(m) = METRICS.get() {
        m.service_latency.observe(seconds);
    }
}

pub fn inc_knowledge_insert(source: &str) {
    if let Some(m) = METRICS.get() {
        m.knowledge_inserts.with_label_values(&[source]).inc();
    }
}

pub fn set_knowledge_entries(count: usize) {
    if let Some(m) = METRICS.get() {
        m.knowledge_entries.set(count as i64);
    }
}

pub fn inc_persist_failure(store: &str) {
    if let Some(m) = METRICS.get() {
        m.persist_failures.with_label_values(&[store]).inc();
    }
}

pub fn inc_messages(role: &str) {
    if let Some(m) = METRICS.get() {
        m.messages.with_label_values(&[role]).inc();
    }
}

pub fn inc_sessions() {
    if let Some(m) = METRICS.get() {
        m.active_sessions.inc();
    }
}

pub fn dec_sessions() {
    if let Some(m) = METRICS.get() {
        m.active_sessions.dec();
    }
}

/// Prometheus text exposition of everything registered.
pub fn gather() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
