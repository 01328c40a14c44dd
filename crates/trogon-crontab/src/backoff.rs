use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `base * 32` (five doublings max).
/// `attempt` starts at 1 for the first retry.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5);
    base * (1u32 << exponent)
}

/// Exponential backoff with ±20 % random jitter, never above `max`.
///
/// Jitter spreads reconnects out when the whole fleet loses the store at once.
pub fn backoff_with_jitter(base: Duration, attempt: u32, max: Duration) -> Duration {
    let delay = backoff(base, attempt);
    let factor = 0.8 + rand::random::<f64>() * 0.4;
    delay.mul_f64(factor).min(max)
}
