use std::time::{Duration, Instant};

/// Render a duration with two decimals and an automatic unit, e.g. `1.94ms` or `2.34s`.
pub fn fmt_duration(d: Duration) -> String {
    format!("{d:.2?}")
}

/// Warn when the store call that began at `start` took longer than `threshold`.
pub fn log_if_slow(start: Instant, threshold: Duration, operation: &str) {
    let elapsed = start.elapsed();
    if elapsed > threshold {
        tracing::warn!(
            operation,
            duration = fmt_duration(elapsed),
            threshold = fmt_duration(threshold),
            "slow store call"
        );
    }
}
