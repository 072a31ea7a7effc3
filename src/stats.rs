use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Capacity of the per-entry response-time sample log.
///
/// Once an entry has seen more samples than this, new samples evict old ones
/// via reservoir sampling (Algorithm R), so percentiles become a best-effort
/// estimate rather than an exact order statistic. `min`/`max` are always
/// tracked exactly and bound the estimate.
pub const SAMPLE_LOG_CAPACITY: usize = 1000;

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Identifies one measured endpoint: `(method, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatsKey {
    pub method: String,
    pub name: String,
}

impl StatsKey {
    pub fn new(method: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            name: name.into(),
        }
    }
}

/// Tally for one error signature, keeping a single representative occurrence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub count: u64,
    /// The full text of the first occurrence seen for this signature.
    pub example: String,
}

/// Aggregated measurements for one `(method, name)` endpoint.
///
/// Entries are created lazily on first observation, reset on explicit clear,
/// and merged (never deleted individually) during aggregation. All merges are
/// commutative and associative over the counter fields so worker-local
/// entries can be combined in any order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub num_requests: u64,
    pub num_failures: u64,
    /// Sum of all response times, in milliseconds.
    pub total_response_time: u64,
    pub min_response_time: Option<u64>,
    pub max_response_time: u64,
    pub total_content_length: u64,
    /// Seconds since the epoch of the first and last recorded request.
    pub first_request_time: Option<f64>,
    pub last_request_time: Option<f64>,
    /// Request and failure counts bucketed by whole epoch second, used for
    /// trailing-window rates.
    requests_per_sec: HashMap<i64, u64>,
    failures_per_sec: HashMap<i64, u64>,
    /// Error signature -> tally. The signature is the first line of the
    /// error text; the record keeps one full representative.
    pub error_counts: HashMap<String, ErrorRecord>,
    samples: Vec<u64>,
    samples_seen: u64,
}

impl StatsEntry {
    pub fn record(&mut self, response_time_ms: u64, content_length: u64) {
        self.record_at(unix_now(), response_time_ms, content_length);
    }

    fn record_at(&mut self, now: f64, response_time_ms: u64, content_length: u64) {
        self.num_requests += 1;
        self.total_content_length += content_length;
        *self.requests_per_sec.entry(now as i64).or_insert(0) += 1;
        if self.first_request_time.is_none() {
            self.first_request_time = Some(now);
        }
        self.last_request_time = Some(match self.last_request_time {
            Some(prev) => prev.max(now),
            None => now,
        });

        self.total_response_time += response_time_ms;
        self.min_response_time = Some(match self.min_response_time {
            Some(min) => min.min(response_time_ms),
            None => response_time_ms,
        });
        self.max_response_time = self.max_response_time.max(response_time_ms);
        self.push_sample(response_time_ms);
    }

    fn push_sample(&mut self, response_time_ms: u64) {
        self.samples_seen += 1;
        if self.samples.len() < SAMPLE_LOG_CAPACITY {
            self.samples.push(response_time_ms);
        } else {
            let slot = rand::thread_rng().gen_range(0..self.samples_seen);
            if (slot as usize) < SAMPLE_LOG_CAPACITY {
                self.samples[slot as usize] = response_time_ms;
            }
        }
    }

    pub fn record_error(&mut self, error: &str) {
        self.record_error_at(unix_now(), error);
    }

    fn record_error_at(&mut self, now: f64, error: &str) {
        self.num_failures += 1;
        *self.failures_per_sec.entry(now as i64).or_insert(0) += 1;
        let signature = error.lines().next().unwrap_or("").to_owned();
        self.error_counts
            .entry(signature)
            .and_modify(|record| record.count += 1)
            .or_insert_with(|| ErrorRecord {
                count: 1,
                example: error.to_owned(),
            });
    }

    /// Response time at rank `ceil(p * len)` of the sorted sample log,
    /// clamped into `[min, max]`. `p <= 0` returns the exact minimum and
    /// `p >= 1` the exact maximum, which hold even after sample eviction.
    ///
    /// Returns `None` when no response times have been recorded.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        let min = self.min_response_time?;
        if self.samples.is_empty() {
            return None;
        }
        if p <= 0.0 {
            return Some(min);
        }
        if p >= 1.0 {
            return Some(self.max_response_time);
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
        Some(sorted[rank - 1].clamp(min, self.max_response_time))
    }

    /// Requests per second over the trailing `window_seconds` ending now.
    ///
    /// Returns 0.0 when no request falls inside the window, including the
    /// case where the last request is older than the window.
    pub fn current_rps(&self, window_seconds: u64) -> f64 {
        self.rps_at(unix_now(), window_seconds)
    }

    fn rps_at(&self, now: f64, window_seconds: u64) -> f64 {
        if window_seconds == 0 {
            return 0.0;
        }
        let end = now as i64;
        let start = end - window_seconds as i64 + 1;
        let count: u64 = (start..=end)
            .map(|second| self.requests_per_sec.get(&second).copied().unwrap_or(0))
            .sum();
        count as f64 / window_seconds as f64
    }

    /// Failures per second over the trailing `window_seconds` ending now.
    pub fn current_fail_per_sec(&self, window_seconds: u64) -> f64 {
        if window_seconds == 0 {
            return 0.0;
        }
        let end = unix_now() as i64;
        let start = end - window_seconds as i64 + 1;
        let count: u64 = (start..=end)
            .map(|second| self.failures_per_sec.get(&second).copied().unwrap_or(0))
            .sum();
        count as f64 / window_seconds as f64
    }

    pub fn avg_response_time(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_response_time as f64 / self.num_requests as f64
        }
    }

    pub fn avg_content_length(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_content_length as f64 / self.num_requests as f64
        }
    }

    pub fn fail_ratio(&self) -> f64 {
        if self.num_requests == 0 {
            if self.num_failures > 0 { 1.0 } else { 0.0 }
        } else {
            self.num_failures as f64 / self.num_requests as f64
        }
    }

    /// Combine another entry into this one.
    ///
    /// Counter fields combine commutatively and associatively; merging a set
    /// of entries in any order yields identical counters. When
    /// `include_samples` is false the sample log is left untouched, which
    /// keeps cross-worker aggregation memory-bounded; when true, the other
    /// log is appended up to [`SAMPLE_LOG_CAPACITY`].
    pub fn merge(&mut self, other: &StatsEntry, include_samples: bool) {
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time += other.total_response_time;
        self.total_content_length += other.total_content_length;
        self.max_response_time = self.max_response_time.max(other.max_response_time);
        self.min_response_time = match (self.min_response_time, other.min_response_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.first_request_time = match (self.first_request_time, other.first_request_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_request_time = match (self.last_request_time, other.last_request_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for (second, count) in &other.requests_per_sec {
            *self.requests_per_sec.entry(*second).or_insert(0) += count;
        }
        for (second, count) in &other.failures_per_sec {
            *self.failures_per_sec.entry(*second).or_insert(0) += count;
        }
        for (signature, record) in &other.error_counts {
            self.error_counts
                .entry(signature.clone())
                .and_modify(|existing| existing.count += record.count)
                .or_insert_with(|| record.clone());
        }
        if include_samples {
            for sample in &other.samples {
                if self.samples.len() >= SAMPLE_LOG_CAPACITY {
                    break;
                }
                self.samples.push(*sample);
            }
        }
        self.samples_seen += other.samples_seen;
    }

    pub fn reset(&mut self) {
        *self = StatsEntry::default();
    }

    /// Copy with the sample log stripped, for bounded-size snapshots.
    fn without_samples(&self) -> StatsEntry {
        let mut copy = self.clone();
        copy.samples.clear();
        copy
    }
}

/// The measurement registry: one [`StatsEntry`] per `(method, name)` key,
/// plus an aggregated total across all keys.
///
/// The registry is plain data; concurrent user sessions share it as
/// `Arc<Mutex<RequestStats>>` through an [`EventSink`], keeping each lock
/// scope to a single mutation.
#[derive(Debug, Default)]
pub struct RequestStats {
    entries: HashMap<StatsKey, StatsEntry>,
    total: StatsEntry,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, method: &str, name: &str, response_time_ms: u64, content_length: u64) {
        let now = unix_now();
        self.entry_mut(method, name)
            .record_at(now, response_time_ms, content_length);
        self.total.record_at(now, response_time_ms, content_length);
    }

    pub fn record_error(&mut self, method: &str, name: &str, error: &str) {
        let now = unix_now();
        self.entry_mut(method, name).record_error_at(now, error);
        self.total.record_error_at(now, error);
    }

    fn entry_mut(&mut self, method: &str, name: &str) -> &mut StatsEntry {
        self.entries
            .entry(StatsKey::new(method, name))
            .or_default()
    }

    pub fn get(&self, method: &str, name: &str) -> Option<&StatsEntry> {
        self.entries.get(&StatsKey::new(method, name))
    }

    pub fn total(&self) -> &StatsEntry {
        &self.total
    }

    pub fn entries(&self) -> impl Iterator<Item = (&StatsKey, &StatsEntry)> {
        self.entries.iter()
    }

    /// Zero all counters while preserving the set of known keys, so a
    /// consumer that enumerated endpoints before the reset still sees them.
    pub fn reset(&mut self) {
        for entry in self.entries.values_mut() {
            entry.reset();
        }
        self.total.reset();
    }

    /// Serializable form of the registry for shipping to a master process.
    pub fn snapshot(&self, include_samples: bool) -> StatsSnapshot {
        let entries = self
            .entries
            .iter()
            .map(|(key, entry)| {
                let entry = if include_samples {
                    entry.clone()
                } else {
                    entry.without_samples()
                };
                (key.clone(), entry)
            })
            .collect();
        StatsSnapshot { entries }
    }

    /// Merge a snapshot received from another process into this registry.
    pub fn merge_snapshot(&mut self, snapshot: &StatsSnapshot, include_samples: bool) {
        for (key, entry) in &snapshot.entries {
            self.entries
                .entry(key.clone())
                .or_default()
                .merge(entry, include_samples);
            self.total.merge(entry, include_samples);
        }
    }
}

/// Wire form of all [`StatsEntry`] values, keyed by `(method, name)`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub entries: Vec<(StatsKey, StatsEntry)>,
}

/// Shared handle through which task engines and external request clients
/// report measurements.
///
/// This is the request-client boundary: a client bound to a user session is
/// expected to call [`EventSink::success`] or [`EventSink::failure`] for
/// every request it performs. Task-level failures are reported by the engine
/// itself via [`EventSink::task_failure`].
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    stats: Arc<Mutex<RequestStats>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&self, method: &str, name: &str, response_time: Duration, content_length: u64) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.record(method, name, response_time.as_millis() as u64, content_length);
    }

    pub fn failure(&self, method: &str, name: &str, response_time: Duration, error: &str) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.record(method, name, response_time.as_millis() as u64, 0);
        stats.record_error(method, name, error);
    }

    /// Record a task body failure (as opposed to a request failure reported
    /// by the client). Recorded under the pseudo-method `TASK`.
    pub fn task_failure(&self, task_name: &str, elapsed: Duration, error: &str) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.record("TASK", task_name, elapsed.as_millis() as u64, 0);
        stats.record_error("TASK", task_name, error);
    }

    /// The shared registry, for reading statistics or taking snapshots.
    pub fn stats(&self) -> Arc<Mutex<RequestStats>> {
        Arc::clone(&self.stats)
    }
}
