use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    pub static ref READING_REQUESTS: Counter =
        register_counter!("reading_requests_total", "Total number of reading requests").unwrap();
    pub static ref RATE_LIMITED: Counter =
        register_counter!("reading_rate_limited_total", "Requests rejected by the rate limiter").unwrap();
    pub static ref DENIALS: CounterVec = register_counter_vec!(
        "reading_denials_total",
        "Requests denied by entitlement policy",
        &["reason"]
    )
    .unwrap();
    pub static ref READINGS_GENERATED: Counter =
        register_counter!("readings_generated_total", "Readings successfully generated").unwrap();
    pub static ref GENERATION_FAILURES: Counter =
        register_counter!("reading_generation_failures_total", "Failed or timed out generations").unwrap();
    pub static ref GENERATION_LATENCY: Histogram = register_histogram!(
        "reading_generation_latency_seconds",
        "Generation latency in seconds"
    )
    .unwrap();
    pub static ref RATE_LIMITER_KEYS: Gauge =
        register_gauge!("rate_limiter_keys", "Live entries in the rate limiter table").unwrap();
}
