//! Metric accumulation, best-value tracking and the per-epoch telemetry
//! record.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use chrono::{Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};

use moevar_common::Result;

use crate::dist::Collective;

/// Window of the moving median.
pub const SMOOTHING_WINDOW: usize = 20;

/// Initial best loss. Finite so it survives a JSON round trip.
const UNSET_LOSS: f64 = 999.0;

// ── Smoothed value ──────────────────────────────────────────────────────────

/// Recent-window median plus a global average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    count: u64,
    total: f64,
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            count: 0,
            total: 0.0,
        }
    }

    pub fn update(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += 1;
        self.total += value;
    }

    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        // Lower median for even windows.
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn last(&self) -> Option<f64> {
        self.window.back().copied()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

// ── Metric logger ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSnapshot {
    pub median: f64,
    pub global_avg: f64,
    pub count: u64,
}

/// Named [`SmoothedValue`]s with a cross-rank synchronization of the global
/// averages.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
}

impl MetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, value: f64) {
        self.meters
            .entry(name.to_string())
            .or_insert_with(|| SmoothedValue::new(SMOOTHING_WINDOW))
            .update(value);
    }

    pub fn get(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn median(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(SmoothedValue::median)
    }

    pub fn global_avg(&self, name: &str) -> Option<f64> {
        self.meters
            .get(name)
            .filter(|m| m.count() > 0)
            .map(SmoothedValue::global_avg)
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricSnapshot> {
        self.meters
            .iter()
            .map(|(k, m)| {
                (
                    k.clone(),
                    MetricSnapshot {
                        median: m.median(),
                        global_avg: m.global_avg(),
                        count: m.count(),
                    },
                )
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.meters.clear();
    }

    /// Sum `count` and `total` of the listed meters across ranks. Every rank
    /// must pass the same names; a meter missing on one rank contributes 0.
    pub fn sync(&mut self, comm: &dyn Collective, names: &[&str]) -> Result<()> {
        let mut buf: Vec<f64> = names
            .iter()
            .flat_map(|n| {
                self.meters
                    .get(*n)
                    .map_or([0.0, 0.0], |m| [m.count as f64, m.total])
            })
            .collect();
        comm.all_reduce_sum(&mut buf)?;
        for (name, pair) in names.iter().zip(buf.chunks_exact(2)) {
            if pair[0] == 0.0 {
                continue;
            }
            let meter = self
                .meters
                .entry(name.to_string())
                .or_insert_with(|| SmoothedValue::new(SMOOTHING_WINDOW));
            meter.count = pair[0] as u64;
            meter.total = pair[1];
        }
        Ok(())
    }

    /// `name: median (global_avg)` for the listed meters that exist.
    pub fn format(&self, names: &[&str]) -> String {
        let mut out = String::new();
        for name in names {
            if let Some(m) = self.meters.get(*name) {
                if !out.is_empty() {
                    out.push_str("  ");
                }
                let _ = write!(out, "{name}: {:.4} ({:.4})", m.median(), m.global_avg());
            }
        }
        out
    }
}

// ── Best values ─────────────────────────────────────────────────────────────

/// Best training and validation values seen so far. Stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestMetricsTracker {
    pub loss_mean: f64,
    pub loss_tail: f64,
    pub acc_mean: f64,
    pub acc_tail: f64,
    pub val_loss_mean: f64,
    pub val_loss_tail: f64,
    pub val_acc_mean: f64,
    pub val_acc_tail: f64,
}

impl Default for BestMetricsTracker {
    fn default() -> Self {
        Self {
            loss_mean: UNSET_LOSS,
            loss_tail: UNSET_LOSS,
            acc_mean: -1.0,
            acc_tail: -1.0,
            val_loss_mean: UNSET_LOSS,
            val_loss_tail: UNSET_LOSS,
            val_acc_mean: -1.0,
            val_acc_tail: -1.0,
        }
    }
}

impl BestMetricsTracker {
    /// Fold in one epoch's training averages; absent values are skipped.
    pub fn update_train(
        &mut self,
        loss_mean: Option<f64>,
        loss_tail: Option<f64>,
        acc_mean: Option<f64>,
        acc_tail: Option<f64>,
    ) {
        if let Some(v) = loss_mean {
            self.loss_mean = self.loss_mean.min(v);
        }
        if let Some(v) = loss_tail {
            self.loss_tail = self.loss_tail.min(v);
        }
        if let Some(v) = acc_mean {
            self.acc_mean = self.acc_mean.max(v);
        }
        if let Some(v) = acc_tail {
            self.acc_tail = self.acc_tail.max(v);
        }
    }

    /// Fold in a validation result. Returns whether the tail loss improved,
    /// which decides the `best` checkpoint.
    pub fn update_val(&mut self, loss_mean: f64, loss_tail: f64, acc_mean: f64, acc_tail: f64) -> bool {
        let improved = loss_tail < self.val_loss_tail;
        self.val_loss_mean = self.val_loss_mean.min(loss_mean);
        self.val_loss_tail = self.val_loss_tail.min(loss_tail);
        self.val_acc_mean = self.val_acc_mean.max(acc_mean);
        self.val_acc_tail = self.val_acc_tail.max(acc_tail);
        improved
    }
}

// ── Telemetry record ────────────────────────────────────────────────────────

/// Per-epoch summary appended to `log.txt`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingTelemetry {
    pub exp_name: String,
    pub epoch: usize,
    pub epochs: usize,
    pub global_step: usize,
    pub total_steps: usize,
    pub iters_per_epoch: usize,
    pub tlr: f64,
    pub twd: f64,
    pub tnm: f64,
    pub loss_mean: Option<f64>,
    pub loss_tail: Option<f64>,
    pub acc_mean: Option<f64>,
    pub acc_tail: Option<f64>,
    pub moe_loss: Option<f64>,
    pub val_loss_mean: Option<f64>,
    pub val_loss_tail: Option<f64>,
    pub val_acc_mean: Option<f64>,
    pub val_acc_tail: Option<f64>,
    pub val_samples: Option<f64>,
    pub best: Option<BestMetricsTracker>,
    pub skipped_updates: u64,
    pub loss_scale_log2: Option<f64>,
    pub epoch_seconds: f64,
    pub remain_time: String,
    pub finish_time: String,
}

impl TrainingTelemetry {
    /// Append as one JSON line.
    pub fn append_to(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(self)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

// ── Time formatting ─────────────────────────────────────────────────────────

/// `H:MM:SS` of a non-negative duration in seconds.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

/// Local wall-clock time `seconds` from now.
pub fn finish_time(seconds: f64) -> String {
    let secs = seconds.max(0.0).min(1e10) as i64;
    let at = Local::now() + ChronoDuration::seconds(secs);
    at.format("%m-%d %H:%M").to_string()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dist::LocalGroup;

    #[test]
    fn smoothed_value_window_and_global() {
        let mut v = SmoothedValue::new(3);
        for x in [5.0, 1.0, 3.0, 100.0] {
            v.update(x);
        }
        // window = [1, 3, 100]
        assert_eq!(v.median(), 3.0);
        assert_eq!(v.max(), 100.0);
        assert_eq!(v.count(), 4);
        assert!((v.global_avg() - 27.25).abs() < 1e-12);
        assert_eq!(v.last(), Some(100.0));
    }

    #[test]
    fn best_policy_updates_only_on_improvement() {
        let mut best = BestMetricsTracker::default();
        let updates: Vec<bool> = [2.0, 1.5, 1.8, 1.2]
            .into_iter()
            .map(|tail| best.update_val(tail + 1.0, tail, 10.0, 5.0))
            .collect();
        assert_eq!(updates, vec![true, true, false, true]);
        assert_eq!(best.val_loss_tail, 1.2);

        let mut best = BestMetricsTracker {
            val_loss_tail: 2.0,
            ..Default::default()
        };
        let later: Vec<bool> = [1.5, 1.8, 1.2]
            .into_iter()
            .map(|tail| best.update_val(tail, tail, 0.0, 0.0))
            .collect();
        assert_eq!(later, vec![true, false, true]);
    }

    #[test]
    fn train_best_skips_missing_values() {
        let mut best = BestMetricsTracker::default();
        best.update_train(Some(3.0), None, Some(10.0), None);
        best.update_train(Some(4.0), None, Some(5.0), None);
        assert_eq!(best.loss_mean, 3.0);
        assert_eq!(best.acc_mean, 10.0);
        assert_eq!(best.loss_tail, UNSET_LOSS);
    }

    #[test]
    fn sync_sums_counts_and_totals() {
        let comms = LocalGroup::new(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let comm: Arc<dyn Collective> = Arc::new(comm);
                    let mut m = MetricLogger::new();
                    if comm.rank() == 0 {
                        m.record("Lm", 1.0);
                        m.record("Lm", 3.0);
                    } else {
                        m.record("Lm", 5.0);
                        m.record("Acct", 50.0);
                    }
                    m.sync(comm.as_ref(), &["Lm", "Acct"]).unwrap();
                    (m.global_avg("Lm"), m.global_avg("Acct"))
                })
            })
            .collect();
        for h in handles {
            let (lm, acct) = h.join().unwrap();
            assert_eq!(lm, Some(3.0));
            assert_eq!(acct, Some(50.0));
        }
    }

    #[test]
    fn telemetry_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let mut t = TrainingTelemetry {
            exp_name: "x".into(),
            ..Default::default()
        };
        t.append_to(&path).unwrap();
        t.epoch = 1;
        t.append_to(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<TrainingTelemetry> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].epoch, 1);
    }

    #[test]
    fn duration_format() {
        assert_eq!(format_duration(3725.2), "1:02:05");
        assert_eq!(format_duration(-3.0), "0:00:00");
        assert!(!finish_time(60.0).is_empty());
    }
}
