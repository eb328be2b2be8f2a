//! Progress aggregation.
//!
//! Transfer workers post events against opaque transfer ids; the aggregator
//! owns the slot table and assembles a snapshot once per second. The rate is
//! a three-term weighted estimate (50% of the last second, 30% of the last
//! thirty seconds, 20% of the whole run) over transferred wire bytes;
//! skipped files never enter the rate windows.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use async_channel::Receiver;

use crate::types::{TransferId, TransferStatistics};

const SHORT_WINDOW: Duration = Duration::from_secs(1);
const MEDIUM_WINDOW: Duration = Duration::from_secs(30);
const SHORT_WEIGHT: f64 = 0.50;
const MEDIUM_WEIGHT: f64 = 0.30;
const OVERALL_WEIGHT: f64 = 0.20;

/// Weighted transfer-rate estimator over cumulative byte samples.
pub struct RateEstimator {
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
    cumulative: u64,
}

impl RateEstimator {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            samples: VecDeque::from([(now, 0)]),
            cumulative: 0,
        }
    }

    pub fn record(&mut self, now: Instant, cumulative_bytes: u64) {
        self.cumulative = cumulative_bytes;
        self.samples.push_back((now, cumulative_bytes));

        // One second of slack beyond the medium window keeps a baseline
        // sample on the far side of it.
        let horizon = MEDIUM_WINDOW + Duration::from_secs(1);
        while let Some(&(instant, _)) = self.samples.front() {
            if now.duration_since(instant) > horizon && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn rate(&self, now: Instant) -> f64 {
        let short = self.window_rate(now, SHORT_WINDOW);
        let medium = self.window_rate(now, MEDIUM_WINDOW);

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let overall = if elapsed > 0.0 {
            self.cumulative as f64 / elapsed
        } else {
            0.0
        };

        SHORT_WEIGHT * short + MEDIUM_WEIGHT * medium + OVERALL_WEIGHT * overall
    }

    fn window_rate(&self, now: Instant, window: Duration) -> f64 {
        let cutoff = now.checked_sub(window);

        // Baseline: the newest sample at or beyond the window edge, falling
        // back to the oldest sample we still hold.
        let mut baseline = *self.samples.front().unwrap_or(&(self.started, 0));
        if let Some(cutoff) = cutoff {
            for &(instant, bytes) in self.samples.iter() {
                if instant <= cutoff {
                    baseline = (instant, bytes);
                } else {
                    break;
                }
            }
        }

        let delta_t = now.duration_since(baseline.0).as_secs_f64();
        if delta_t <= 0.0 {
            return 0.0;
        }

        (self.cumulative.saturating_sub(baseline.1)) as f64 / delta_t
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLine {
    pub id: TransferId,
    pub key: String,
    pub done_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub slots: Vec<SlotLine>,
    pub total_files: u64,
    pub total_bytes: u64,
    pub completed_files: u64,
    pub completed_bytes: u64,
    pub skipped_files: u64,
    pub aborted_files: u64,
    pub transferred_bytes: u64,
    pub rate_bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

pub struct ProgressAggregator {
    receiver: Receiver<TransferStatistics>,
    slots: BTreeMap<TransferId, SlotLine>,
    rate: RateEstimator,
    total_files: u64,
    total_bytes: u64,
    completed_files: u64,
    completed_bytes: u64,
    skipped_files: u64,
    aborted_files: u64,
    transferred_bytes: u64,
}

impl ProgressAggregator {
    pub fn new(receiver: Receiver<TransferStatistics>) -> Self {
        Self::with_start_time(receiver, Instant::now())
    }

    pub fn with_start_time(receiver: Receiver<TransferStatistics>, now: Instant) -> Self {
        Self {
            receiver,
            slots: BTreeMap::new(),
            rate: RateEstimator::new(now),
            total_files: 0,
            total_bytes: 0,
            completed_files: 0,
            completed_bytes: 0,
            skipped_files: 0,
            aborted_files: 0,
            transferred_bytes: 0,
        }
    }

    /// Absorbs every queued event and records a rate sample.
    pub fn drain(&mut self, now: Instant) {
        self.drain_with(now, |_| {});
    }

    /// Like [`drain`](Self::drain), but hands every event to `on_event`
    /// first, so a renderer can emit per-file lines alongside the status
    /// display.
    pub fn drain_with(&mut self, now: Instant, mut on_event: impl FnMut(&TransferStatistics)) {
        while let Ok(stats) = self.receiver.try_recv() {
            on_event(&stats);
            match stats {
                TransferStatistics::TotalDiscovered { files, bytes } => {
                    self.total_files += files;
                    self.total_bytes += bytes;
                }
                TransferStatistics::TransferStart {
                    id,
                    key,
                    total_bytes,
                } => {
                    self.slots.insert(
                        id,
                        SlotLine {
                            id,
                            key,
                            done_bytes: 0,
                            total_bytes,
                        },
                    );
                }
                TransferStatistics::TransferBytes { id, bytes } => {
                    if let Some(slot) = self.slots.get_mut(&id) {
                        slot.done_bytes += bytes;
                    }
                    self.transferred_bytes += bytes;
                }
                TransferStatistics::TransferComplete { id, bytes, .. } => {
                    self.slots.remove(&id);
                    self.completed_files += 1;
                    self.completed_bytes += bytes;
                }
                TransferStatistics::TransferSkip { id, bytes, .. } => {
                    self.slots.remove(&id);
                    // Skipped counts as completed, but never enters the rate
                    // windows.
                    self.skipped_files += 1;
                    self.completed_files += 1;
                    self.completed_bytes += bytes;
                }
                TransferStatistics::TransferAbort { id, .. } => {
                    self.slots.remove(&id);
                    self.aborted_files += 1;
                }
            }
        }

        self.rate.record(now, self.transferred_bytes);
    }

    pub fn is_finished(&self) -> bool {
        self.receiver.is_closed() && self.receiver.is_empty()
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let rate_bytes_per_sec = self.rate.rate(now);

        let done_bytes = self.completed_bytes
            + self
                .slots
                .values()
                .map(|slot| slot.done_bytes)
                .sum::<u64>();
        let remaining = self.total_bytes.saturating_sub(done_bytes);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if rate_bytes_per_sec > 0.0 {
            Some(Duration::from_secs_f64(
                remaining as f64 / rate_bytes_per_sec,
            ))
        } else {
            None
        };

        ProgressSnapshot {
            slots: self.slots.values().cloned().collect(),
            total_files: self.total_files,
            total_bytes: self.total_bytes,
            completed_files: self.completed_files,
            completed_bytes: self.completed_bytes,
            skipped_files: self.skipped_files,
            aborted_files: self.aborted_files,
            transferred_bytes: self.transferred_bytes,
            rate_bytes_per_sec,
            eta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 0.5
    }

    #[test]
    fn constant_rate_collapses_to_itself() {
        let start = Instant::now();
        let mut estimator = RateEstimator::new(start);

        // 100 bytes per second, sampled every second for 40 seconds.
        for second in 1..=40u64 {
            estimator.record(start + Duration::from_secs(second), second * 100);
        }

        let rate = estimator.rate(start + Duration::from_secs(40));
        assert!(approx(rate, 100.0), "rate was {rate}");
    }

    #[test]
    fn burst_is_dominated_by_the_short_window() {
        let start = Instant::now();
        let mut estimator = RateEstimator::new(start);

        // Nothing for 30 seconds, then 1000 bytes in the final second.
        for second in 1..=30u64 {
            estimator.record(start + Duration::from_secs(second), 0);
        }
        let now = start + Duration::from_secs(31);
        estimator.record(now, 1000);

        let rate = estimator.rate(now);
        // short = 1000/1, medium = 1000/30, overall = 1000/31
        let expected = 0.5 * 1000.0 + 0.3 * (1000.0 / 30.0) + 0.2 * (1000.0 / 31.0);
        assert!(approx(rate, expected), "rate was {rate}, expected {expected}");
    }

    #[test]
    fn idle_estimator_reports_zero() {
        let start = Instant::now();
        let estimator = RateEstimator::new(start);
        assert_eq!(estimator.rate(start + Duration::from_secs(5)), 0.0);
    }

    #[tokio::test]
    async fn aggregator_tracks_slots_and_counters() {
        let (sender, receiver) = async_channel::unbounded();
        let start = Instant::now();
        let mut aggregator = ProgressAggregator::with_start_time(receiver, start);

        sender
            .send(TransferStatistics::TotalDiscovered {
                files: 3,
                bytes: 600,
            })
            .await
            .unwrap();
        sender
            .send(TransferStatistics::TransferStart {
                id: 1,
                key: "A/1".to_string(),
                total_bytes: 200,
            })
            .await
            .unwrap();
        sender
            .send(TransferStatistics::TransferBytes { id: 1, bytes: 150 })
            .await
            .unwrap();
        sender
            .send(TransferStatistics::TransferStart {
                id: 2,
                key: "A/2".to_string(),
                total_bytes: 200,
            })
            .await
            .unwrap();
        sender
            .send(TransferStatistics::TransferSkip {
                id: 2,
                key: "A/2".to_string(),
                bytes: 200,
            })
            .await
            .unwrap();

        aggregator.drain(start + Duration::from_secs(1));
        let snapshot = aggregator.snapshot(start + Duration::from_secs(1));

        assert_eq!(snapshot.total_files, 3);
        assert_eq!(snapshot.total_bytes, 600);
        assert_eq!(snapshot.slots.len(), 1);
        assert_eq!(snapshot.slots[0].key, "A/1");
        assert_eq!(snapshot.slots[0].done_bytes, 150);
        assert_eq!(snapshot.skipped_files, 1);
        // Skipped also counts as completed.
        assert_eq!(snapshot.completed_files, 1);
        assert_eq!(snapshot.completed_bytes, 200);
        // Skipped bytes do not enter the rate windows.
        assert_eq!(snapshot.transferred_bytes, 150);

        sender
            .send(TransferStatistics::TransferComplete {
                id: 1,
                key: "A/1".to_string(),
                bytes: 200,
            })
            .await
            .unwrap();
        aggregator.drain(start + Duration::from_secs(2));
        let snapshot = aggregator.snapshot(start + Duration::from_secs(2));

        assert!(snapshot.slots.is_empty());
        assert_eq!(snapshot.completed_files, 2);
        assert_eq!(snapshot.completed_bytes, 400);

        drop(sender);
        assert!(aggregator.is_finished());
    }

    #[tokio::test]
    async fn eta_zero_when_everything_is_done() {
        let (sender, receiver) = async_channel::unbounded();
        let start = Instant::now();
        let mut aggregator = ProgressAggregator::with_start_time(receiver, start);

        sender
            .send(TransferStatistics::TotalDiscovered {
                files: 1,
                bytes: 100,
            })
            .await
            .unwrap();
        sender
            .send(TransferStatistics::TransferStart {
                id: 1,
                key: "f".to_string(),
                total_bytes: 100,
            })
            .await
            .unwrap();
        sender
            .send(TransferStatistics::TransferBytes { id: 1, bytes: 100 })
            .await
            .unwrap();
        sender
            .send(TransferStatistics::TransferComplete {
                id: 1,
                key: "f".to_string(),
                bytes: 100,
            })
            .await
            .unwrap();

        aggregator.drain(start + Duration::from_secs(1));
        let snapshot = aggregator.snapshot(start + Duration::from_secs(1));
        assert_eq!(snapshot.eta, Some(Duration::ZERO));
    }
}
