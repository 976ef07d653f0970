//! In-process metrics: latency summaries with a percentile view, and counters.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Observations kept per summary for percentile queries. Count and sum
/// cover every observation.
pub const SUMMARY_WINDOW: usize = 1_000;
pub const DEFAULT_PERCENTILE: f64 = 0.95;

#[derive(Debug, Default)]
struct SummaryStat {
    count: u64,
    sum: f64,
    window: VecDeque<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub count: u64,
    pub avg: f64,
    pub percentile: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub summaries: BTreeMap<String, Summary>,
    pub counters: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    summaries: Mutex<HashMap<String, SummaryStat>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, key: &str, value: f64) {
        let mut summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        let stat = summaries.entry(key.to_owned()).or_default();
        stat.count += 1;
        stat.sum += value;
        stat.window.push_back(value);
        if stat.window.len() > SUMMARY_WINDOW {
            stat.window.pop_front();
        }
    }

    pub fn increment(&self, key: &str) {
        self.increment_by(key, 1);
    }

    pub fn increment_by(&self, key: &str, delta: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(key.to_owned()).or_default() += delta;
    }

    pub fn counter(&self, key: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(key).copied().unwrap_or(0)
    }

    /// Count, mean and the nearest-rank `percentile` (0.0..=1.0) of `key`.
    /// An unknown key summarizes to zeros.
    pub fn summarize(&self, key: &str, percentile: f64) -> Summary {
        let summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        summaries.get(key).map(|stat| summarize(stat, percentile)).unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let summaries = self
            .summaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, stat)| (key.clone(), summarize(stat, DEFAULT_PERCENTILE)))
            .collect();
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, value)| (key.clone(), *value))
            .collect();
        MetricsSnapshot { summaries, counters }
    }
}

fn summarize(stat: &SummaryStat, percentile: f64) -> Summary {
    if stat.count == 0 || stat.window.is_empty() {
        return Summary::default();
    }
    let mut sorted: Vec<f64> = stat.window.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let rank = (sorted.len() as f64 * percentile.clamp(0.0, 1.0)).floor() as usize;
    Summary {
        count: stat.count,
        avg: stat.sum / stat.count as f64,
        percentile: sorted[rank.min(sorted.len() - 1)],
    }
}
