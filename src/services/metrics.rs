use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, GaugeVec};

lazy_static! {
    // ── Event counters (increment on each event) ────────────────────────────
    pub static ref REQUESTS_COUNTER: CounterVec = register_counter_vec!(
        "api_requests_total",
        "Requests to /api by action and outcome",
        &["action", "outcome"]
    ).unwrap();

    pub static ref LOGINS_COUNTER: CounterVec = register_counter_vec!(
        "api_logins_total",
        "Login attempts by outcome",
        &["status"]
    ).unwrap();

    pub static ref PASSWORD_RESETS_COUNTER: CounterVec = register_counter_vec!(
        "api_password_resets_total",
        "Password reset requests and confirmations",
        &["stage"]
    ).unwrap();

    pub static ref RECONCILIATIONS_COUNTER: CounterVec = register_counter_vec!(
        "billing_reconciliations_total",
        "Billing resolutions by winning signal source",
        &["source"]
    ).unwrap();

    pub static ref CAS_CONFLICTS_COUNTER: CounterVec = register_counter_vec!(
        "store_write_conflicts_total",
        "Optimistic write conflicts by table",
        &["table"]
    ).unwrap();

    pub static ref ONBOARDING_COUNTER: CounterVec = register_counter_vec!(
        "api_onboarding_checks_total",
        "Onboarding gate decisions",
        &["result"]
    ).unwrap();

    // ── Business metrics (refreshed by the grace sweep) ─────────────────────
    pub static ref SITES_GAUGE: GaugeVec = register_gauge_vec!(
        "sites_by_state",
        "Sites per access state at the last sweep",
        &["state"]
    ).unwrap();
}
