//! Prometheus helpers shared by the inspector and the metrics endpoint

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Encodes every metric family of `registry` in the text exposition format
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Counters for inspected connections
#[derive(Clone)]
pub struct InspectMetrics {
    pub(crate) connections: IntCounterVec,
    pub(crate) decisions: IntCounterVec,
    pub(crate) errors: IntCounterVec,
}

impl InspectMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections = IntCounterVec::new(
            Opts::new(
                "filterd_connections_total",
                "Total inspected connections by detected protocol",
            ),
            &["protocol"],
        )?;
        let decisions = IntCounterVec::new(
            Opts::new(
                "filterd_decisions_total",
                "Total filter decisions by outcome",
            ),
            &["decision"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("filterd_inspect_errors_total", "Total inspection errors by kind"),
            &["kind"],
        )?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            connections,
            decisions,
            errors,
        })
    }
}
