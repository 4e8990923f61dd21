//! Metric recording helpers
//!
//! - `token_refresh_total` (counter): label `outcome`
//! - `device_flow_polls_total` (counter): label `outcome`

pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("token_refresh_total", "outcome" => outcome).increment(1);
}

pub fn record_poll(outcome: &'static str) {
    metrics::counter!("device_flow_polls_total", "outcome" => outcome).increment(1);
}
