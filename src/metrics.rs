//! Prometheus metrics for pool, execution and orchestration observability.
//!
//! Metrics live in the default registry; `gather_metrics` renders them in
//! the text exposition format for whatever scrape surface embeds this crate.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram, TextEncoder,
};

lazy_static! {
    /// Warm instances ready for assignment.
    pub static ref SANDBOX_WARM: Gauge = register_gauge!(
        "cowork_sandbox_warm",
        "Number of warm sandbox instances ready for reuse"
    )
    .expect("metric registration");

    /// Instances currently executing a command.
    pub static ref SANDBOX_ACTIVE: Gauge = register_gauge!(
        "cowork_sandbox_active",
        "Number of sandbox instances currently executing"
    )
    .expect("metric registration");

    pub static ref SANDBOX_BOOT_DURATION: Histogram = register_histogram!(
        "cowork_sandbox_boot_duration_seconds",
        "Time from start() to a ready execution channel"
    )
    .expect("metric registration");

    pub static ref SANDBOX_EXEC_DURATION: Histogram = register_histogram!(
        "cowork_sandbox_exec_duration_seconds",
        "Guest command execution duration"
    )
    .expect("metric registration");

    /// start() outcomes: warm_hit, created, failed, rejected.
    pub static ref SANDBOX_STARTS: CounterVec = register_counter_vec!(
        "cowork_sandbox_starts_total",
        "Sandbox start requests by outcome",
        &["outcome"]
    )
    .expect("metric registration");

    pub static ref SANDBOX_EVICTIONS: Counter = register_counter!(
        "cowork_sandbox_evictions_total",
        "Warm instances evicted by the idle sweep"
    )
    .expect("metric registration");

    pub static ref TOOL_CALLS: CounterVec = register_counter_vec!(
        "cowork_tool_calls_total",
        "Tool calls dispatched, by tool and status",
        &["tool", "status"]
    )
    .expect("metric registration");

    /// Delegation attempts by target agent and outcome
    /// (ok, cycle, depth, denied).
    pub static ref DELEGATIONS: CounterVec = register_counter_vec!(
        "cowork_delegations_total",
        "Delegation attempts by target agent and outcome",
        &["agent", "outcome"]
    )
    .expect("metric registration");

    pub static ref CONVERSATION_TURNS: Counter = register_counter!(
        "cowork_conversation_turns_total",
        "User turns routed through the orchestrator"
    )
    .expect("metric registration");
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
