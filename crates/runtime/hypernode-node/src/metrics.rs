use lazy_static::lazy_static;
use prometheus::{
    opts, register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge,
    Gauge, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref OFFERS_ACCEPTED_TOTAL: IntCounter =
        register_int_counter!(
            opts!("hypernode_offers_accepted_total", "Job offers admitted by the scheduler")
        ).expect("register hypernode_offers_accepted_total");

    pub static ref OFFERS_REJECTED_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            opts!("hypernode_offers_rejected_total", "Job offers rejected at admission, by reason"),
            &["reason"]
        ).expect("register hypernode_offers_rejected_total");

    pub static ref JOBS_FINISHED_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            opts!("hypernode_jobs_finished_total", "Jobs reaching a terminal state, by state"),
            &["state"]
        ).expect("register hypernode_jobs_finished_total");

    pub static ref JOBS_IN_FLIGHT: IntGauge =
        register_int_gauge!(
            opts!("hypernode_jobs_in_flight", "Jobs currently admitted and not yet terminal")
        ).expect("register hypernode_jobs_in_flight");

    pub static ref HEARTBEAT_FAILURES_TOTAL: IntCounter =
        register_int_counter!(
            opts!("hypernode_heartbeat_failures_total", "Heartbeats the coordinator did not acknowledge")
        ).expect("register hypernode_heartbeat_failures_total");

    pub static ref HEALTH_CHECKS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            opts!("hypernode_health_checks_total", "Inbound health checks, by verdict"),
            &["verdict"]
        ).expect("register hypernode_health_checks_total");

    pub static ref REPUTATION_SCORE: Gauge =
        register_gauge!(
            opts!("hypernode_reputation_score", "Current local reputation score (0-1000)")
        ).expect("register hypernode_reputation_score");

    pub static ref RECONCILIATION_CONFLICTS_TOTAL: IntCounter =
        register_int_counter!(
            opts!("hypernode_reconciliation_conflicts_total", "Times the ledger replaced a diverged local reputation")
        ).expect("register hypernode_reconciliation_conflicts_total");

    pub static ref REPORT_FAILURES_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            opts!("hypernode_report_failures_total", "Coordinator or ledger sends that failed, by endpoint"),
            &["endpoint"]
        ).expect("register hypernode_report_failures_total");
}

pub fn record_offer_accepted() {
    OFFERS_ACCEPTED_TOTAL.inc();
}

pub fn record_offer_rejected(reason: &str) {
    OFFERS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_job_finished(state: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[state]).inc();
}

pub fn set_in_flight(n: usize) {
    JOBS_IN_FLIGHT.set(n as i64);
}

pub fn record_heartbeat_failure() {
    HEARTBEAT_FAILURES_TOTAL.inc();
}

pub fn record_health_check(verdict: &str) {
    HEALTH_CHECKS_TOTAL.with_label_values(&[verdict]).inc();
}

pub fn set_reputation_score(score: f64) {
    REPUTATION_SCORE.set(score);
}

pub fn record_reconciliation_conflict() {
    RECONCILIATION_CONFLICTS_TOTAL.inc();
}

pub fn record_report_failure(endpoint: &str) {
    REPORT_FAILURES_TOTAL.with_label_values(&[endpoint]).inc();
}
