//! 进程内计数器，渲染为 Prometheus 文本格式

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, OnceLock},
};

static METRICS: OnceLock<Mutex<MetricsState>> = OnceLock::new();

#[derive(Default)]
struct MetricsState {
    wallets_created: u64,
    // 转账结果：submitted 或错误码
    transfers: BTreeMap<&'static str, u64>,
    signatures: BTreeMap<&'static str, u64>,
    quorum_executions: u64,
    reconcile_passes: u64,
    reconcile_completed: u64,
    reconcile_failed: u64,
    reconcile_errors: u64,
    keys_rotated: u64,
    // 节点调用成功/失败与时延（毫秒）
    rpc_ok: u64,
    rpc_err: u64,
    rpc_latency_sum_ms: u128,
    // <50, <100, <250, <500, <1000, >=1000
    rpc_hist_buckets: [u64; 6],
}

fn state() -> MutexGuard<'static, MetricsState> {
    let lock = METRICS.get_or_init(|| Mutex::new(MetricsState::default()));
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(), // 避免因锁污染导致 panic
    }
}

pub fn wallet_created() {
    state().wallets_created += 1;
}

/// outcome: "submitted" 或 AppError::code()
pub fn transfer(outcome: &'static str) {
    *state().transfers.entry(outcome).or_insert(0) += 1;
}

/// outcome: "accepted" 或 AppError::code()
pub fn signature(outcome: &'static str) {
    *state().signatures.entry(outcome).or_insert(0) += 1;
}

pub fn quorum_executed() {
    state().quorum_executions += 1;
}

pub fn reconcile_pass(completed: u64, failed: u64, errors: u64) {
    let mut s = state();
    s.reconcile_passes += 1;
    s.reconcile_completed += completed;
    s.reconcile_failed += failed;
    s.reconcile_errors += errors;
}

pub fn keys_rotated(count: u64) {
    state().keys_rotated += count;
}

pub fn observe_rpc_latency_ms(latency_ms: u128, ok: bool) {
    let mut s = state();
    if ok {
        s.rpc_ok += 1;
    } else {
        s.rpc_err += 1;
    }
    s.rpc_latency_sum_ms += latency_ms;
    let b = match latency_ms {
        0..=49 => 0,
        50..=99 => 1,
        100..=249 => 2,
        250..=499 => 3,
        500..=999 => 4,
        _ => 5,
    };
    s.rpc_hist_buckets[b] += 1;
}

fn counter(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name} {value}\n"));
}

fn labelled(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    values: &BTreeMap<&'static str, u64>,
) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (k, v) in values {
        out.push_str(&format!("{name}{{{label}=\"{k}\"}} {v}\n"));
    }
}

pub fn render_prometheus() -> String {
    let s = state();
    let mut out = String::new();

    counter(
        &mut out,
        "ironvault_wallets_created_total",
        "Custodial wallets created",
        s.wallets_created,
    );
    labelled(
        &mut out,
        "ironvault_transfers_total",
        "Transfer attempts by outcome",
        "outcome",
        &s.transfers,
    );
    labelled(
        &mut out,
        "ironvault_signatures_total",
        "Multisig signing attempts by outcome",
        "outcome",
        &s.signatures,
    );
    counter(
        &mut out,
        "ironvault_quorum_executions_total",
        "Quorum-triggered executions",
        s.quorum_executions,
    );
    counter(
        &mut out,
        "ironvault_reconcile_passes_total",
        "Reconciler passes",
        s.reconcile_passes,
    );
    counter(
        &mut out,
        "ironvault_reconcile_completed_total",
        "Transactions finalized as completed",
        s.reconcile_completed,
    );
    counter(
        &mut out,
        "ironvault_reconcile_failed_total",
        "Transactions finalized as failed",
        s.reconcile_failed,
    );
    counter(
        &mut out,
        "ironvault_reconcile_errors_total",
        "Per-transaction reconcile errors",
        s.reconcile_errors,
    );
    counter(
        &mut out,
        "ironvault_keys_rotated_total",
        "Wallet keys re-encrypted under a new master key",
        s.keys_rotated,
    );

    out.push_str("# HELP ironvault_rpc_requests_total Node RPC requests\n");
    out.push_str("# TYPE ironvault_rpc_requests_total counter\n");
    out.push_str(&format!(
        "ironvault_rpc_requests_total{{result=\"ok\"}} {}\n",
        s.rpc_ok
    ));
    out.push_str(&format!(
        "ironvault_rpc_requests_total{{result=\"err\"}} {}\n",
        s.rpc_err
    ));

    counter(
        &mut out,
        "ironvault_rpc_latency_ms_sum",
        "Sum of node RPC latency in ms",
        s.rpc_latency_sum_ms,
    );

    out.push_str("# HELP ironvault_rpc_latency_ms_bucket Node RPC latency histogram buckets\n");
    out.push_str("# TYPE ironvault_rpc_latency_ms_bucket histogram\n");
    let bounds = [50, 100, 250, 500, 1000];
    let mut cumulative = 0;
    for (i, bound) in bounds.iter().enumerate() {
        cumulative += s.rpc_hist_buckets[i];
        out.push_str(&format!(
            "ironvault_rpc_latency_ms_bucket{{le=\"{}\"}} {}\n",
            bound, cumulative
        ));
    }
    out.push_str(&format!(
        "ironvault_rpc_latency_ms_bucket{{le=\"+Inf\"}} {}\n",
        s.rpc_hist_buckets.iter().sum::<u64>()
    ));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        transfer("submitted");
        transfer("insufficient_funds");
        signature("already_signed");
        observe_rpc_latency_ms(120, true);

        let text = render_prometheus();
        assert!(text.contains("ironvault_transfers_total{outcome=\"submitted\"}"));
        assert!(text.contains("ironvault_transfers_total{outcome=\"insufficient_funds\"}"));
        assert!(text.contains("ironvault_signatures_total{outcome=\"already_signed\"}"));
        assert!(text.contains("ironvault_rpc_latency_ms_bucket{le=\"+Inf\"}"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        observe_rpc_latency_ms(10, true);
        let text = render_prometheus();

        let value = |le: &str| -> u64 {
            let prefix = format!("ironvault_rpc_latency_ms_bucket{{le=\"{le}\"}} ");
            text.lines()
                .find_map(|l| l.strip_prefix(&prefix))
                .unwrap()
                .parse()
                .unwrap()
        };
        assert!(value("50") <= value("100"));
        assert!(value("1000") <= value("+Inf"));
        assert!(value("50") >= 1);
    }
}
