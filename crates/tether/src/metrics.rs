use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::TetherResult;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CONNECT_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tether_connect_total", "browser connect attempts by result"),
        &["result"],
    )
    .expect("valid connect counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PEER_AVAILABILITY: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_peer_availability_total",
            "peer availability events raised by state",
        ),
        &["available"],
    )
    .expect("valid availability counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ADVERTISER_SOCKETS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_advertiser_socket_total",
            "virtual sockets created for peer-initiated streams by result",
        ),
        &["result"],
    )
    .expect("valid advertiser counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn outcome<T>(result: &TetherResult<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    }
}

pub fn record_connect<T>(result: &TetherResult<T>) {
    CONNECT_ATTEMPTS.with_label_values(&[outcome(result)]).inc();
}

pub fn record_availability(available: bool) {
    PEER_AVAILABILITY
        .with_label_values(&[if available { "true" } else { "false" }])
        .inc();
}

pub fn record_advertiser_socket<T>(result: &TetherResult<T>) {
    ADVERTISER_SOCKETS.with_label_values(&[outcome(result)]).inc();
}

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(target = "tether::metrics", error = %err, "metrics encode error");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;

    #[test]
    fn connect_outcomes_are_labelled_by_error_kind() {
        let before = CONNECT_ATTEMPTS.with_label_values(&["timed_out"]).get();
        record_connect::<()>(&Err(TetherError::ConnectionTimedOut));
        assert!(CONNECT_ATTEMPTS.with_label_values(&["timed_out"]).get() > before);

        let text = String::from_utf8(gather()).expect("utf8 exposition");
        assert!(text.contains("tether_connect_total"));
    }
}
