//! Prometheus counters for battles, deposits, withdrawals and queue evictions.

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::debug;

use crate::types::{Currency, TransactionStatus};

// === Metric Name Constants ===

pub const METRIC_QUEUE_ENTRIES: &str = "battle_queue_entries_total";
pub const METRIC_QUEUE_EVICTIONS: &str = "battle_queue_evictions_total";
pub const METRIC_BATTLES_CREATED: &str = "battles_created_total";
pub const METRIC_BATTLES_RESOLVED: &str = "battles_resolved_total";
pub const METRIC_DEPOSITS_CREDITED: &str = "deposits_credited_total";
pub const METRIC_DEPOSITS_REJECTED: &str = "deposits_rejected_total";
pub const METRIC_WITHDRAWALS_REQUESTED: &str = "withdrawals_requested_total";
pub const METRIC_WITHDRAWALS_SETTLED: &str = "withdrawals_settled_total";
pub const METRIC_ORACLE_FAILURES: &str = "price_oracle_failures_total";

/// Install the global recorder. The handle renders `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    init_metrics();
    Ok(handle)
}

/// Register metric descriptions.
pub fn init_metrics() {
    describe_counter!(METRIC_QUEUE_ENTRIES, "Queue entries accepted");
    describe_counter!(METRIC_QUEUE_EVICTIONS, "Queue entries evicted for insufficient funds at match time");
    describe_counter!(METRIC_BATTLES_CREATED, "Battles created by the matching engine");
    describe_counter!(METRIC_BATTLES_RESOLVED, "Battles resolved, labelled by winning side");
    describe_counter!(METRIC_DEPOSITS_CREDITED, "Deposits credited to the ledger");
    describe_counter!(METRIC_DEPOSITS_REJECTED, "Deposit submissions rejected, labelled by reason");
    describe_counter!(METRIC_WITHDRAWALS_REQUESTED, "Withdrawal requests accepted");
    describe_counter!(METRIC_WITHDRAWALS_SETTLED, "Withdrawals moved to a terminal status");
    describe_counter!(METRIC_ORACLE_FAILURES, "Battle operations aborted because no price was available");

    debug!("Metrics initialized");
}

pub fn inc_queue_entries(currency: Currency) {
    counter!(METRIC_QUEUE_ENTRIES, "currency" => currency.as_str()).increment(1);
}

pub fn inc_queue_evictions(currency: Currency, count: u64) {
    counter!(METRIC_QUEUE_EVICTIONS, "currency" => currency.as_str()).increment(count);
}

pub fn inc_battles_created(currency: Currency) {
    counter!(METRIC_BATTLES_CREATED, "currency" => currency.as_str()).increment(1);
}

pub fn inc_battles_resolved(winner: &'static str) {
    counter!(METRIC_BATTLES_RESOLVED, "winner" => winner).increment(1);
}

pub fn inc_deposits_credited(currency: Currency) {
    counter!(METRIC_DEPOSITS_CREDITED, "currency" => currency.as_str()).increment(1);
}

pub fn inc_deposits_rejected(reason: &'static str) {
    counter!(METRIC_DEPOSITS_REJECTED, "reason" => reason).increment(1);
}

pub fn inc_withdrawals_requested(currency: Currency) {
    counter!(METRIC_WITHDRAWALS_REQUESTED, "currency" => currency.as_str()).increment(1);
}

pub fn inc_withdrawals_settled(status: TransactionStatus) {
    counter!(METRIC_WITHDRAWALS_SETTLED, "status" => status.as_str()).increment(1);
}

pub fn inc_oracle_failures() {
    counter!(METRIC_ORACLE_FAILURES).increment(1);
}
