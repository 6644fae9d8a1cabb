//! Observation points, published through the process-wide [`metrics`] facade.
//!
//! The embedding application installs whatever recorder it exports from
//! (Prometheus, statsd, ...); without one these calls are no-ops.

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

use crate::packet::OpCode;

/// Gauge: shards currently holding a live connection, labeled by shard index.
pub const SHARDS_ALIVE: &str = "gateway_shards_alive";
/// Counter: decoded inbound packets, labeled by event, opcode, and shard.
pub const PACKETS_RECEIVED: &str = "gateway_packets_received_total";
/// Counter: outbound packets, labeled by opcode and shard.
pub const PACKETS_SENT: &str = "gateway_packets_sent_total";
/// Histogram: heartbeat round-trip time in milliseconds, labeled by shard.
pub const PING_MS: &str = "gateway_ping_ms";

pub(crate) fn shard_connected(shard: &str) {
    gauge!(SHARDS_ALIVE, "shard" => shard.to_owned()).increment(1.0);
}

pub(crate) fn shard_disconnected(shard: &str) {
    gauge!(SHARDS_ALIVE, "shard" => shard.to_owned()).decrement(1.0);
}

pub(crate) fn packet_received(event: &str, op: OpCode, shard: &str) {
    counter!(
        PACKETS_RECEIVED,
        "event" => event.to_owned(),
        "op" => u8::from(op).to_string(),
        "shard" => shard.to_owned()
    )
    .increment(1);
}

pub(crate) fn packet_sent(op: OpCode, shard: &str) {
    counter!(
        PACKETS_SENT,
        "op" => u8::from(op).to_string(),
        "shard" => shard.to_owned()
    )
    .increment(1);
}

pub(crate) fn ping_observed(shard: &str, rtt: Duration) {
    histogram!(PING_MS, "shard" => shard.to_owned()).record(rtt.as_secs_f64() * 1000.0);
}
