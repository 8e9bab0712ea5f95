//! Throughput and lag reporting for the streaming phase.
//!
//! The reporter keeps a sliding window of events applied per ten-second
//! bucket over the last ten minutes and periodically logs totals, ingestion
//! rates, remaining events, and an estimated time to catch up with the
//! exporter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::BargeResult;
use crate::target::TargetDb;
use crate::types::EventCounts;

/// One ten-second bucket per slot: slot 0 is the open bucket, the remaining
/// 60 cover the last ten minutes.
const WINDOW_SLOTS: usize = 61;

/// How often the window slides and a report is emitted.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct StatsInner {
    total_events_imported: i64,
    current_run_imported: i64,
    events_sliding_window: [i64; WINDOW_SLOTS],
    remaining_events: i64,
    catch_up_estimate: Option<Duration>,
}

/// Aggregates streaming statistics for the operator.
///
/// Counters are updated concurrently by every channel worker; a mutex guards
/// them.
#[derive(Debug)]
pub struct StreamImportStatsReporter {
    migration_uuid: Uuid,
    start_time: Instant,
    inner: Mutex<StatsInner>,
}

impl StreamImportStatsReporter {
    pub fn new(migration_uuid: Uuid) -> Self {
        Self {
            migration_uuid,
            start_time: Instant::now(),
            inner: Mutex::new(StatsInner {
                total_events_imported: 0,
                current_run_imported: 0,
                events_sliding_window: [0; WINDOW_SLOTS],
                remaining_events: 0,
                catch_up_estimate: None,
            }),
        }
    }

    /// Seeds the total from what previous runs already imported into the
    /// target.
    pub async fn init(&self, target: &TargetDb) -> BargeResult<()> {
        let counts = target
            .total_events_imported_by_type(self.migration_uuid)
            .await?;

        let mut inner = self.inner.lock().await;
        inner.total_events_imported = counts.total();

        Ok(())
    }

    /// Records one applied batch.
    pub async fn batch_imported(&self, counts: &EventCounts) {
        let total = counts.total();

        let mut inner = self.inner.lock().await;
        inner.current_run_imported += total;
        inner.total_events_imported += total;
        inner.events_sliding_window[0] += total;
    }

    /// Refreshes the remaining-events figure against the exporter's total and
    /// re-estimates the catch-up time from the last minute's rate.
    pub async fn update_remaining_events(&self, total_exported: i64) {
        let mut inner = self.inner.lock().await;

        inner.remaining_events = total_exported - inner.total_events_imported;
        let last_minute_rate = ingestion_rate_per_minute(&inner.events_sliding_window, 1);
        if last_minute_rate > 0 {
            inner.catch_up_estimate = Some(Duration::from_secs(
                (inner.remaining_events / last_minute_rate).max(0) as u64 * 60,
            ));
        }
    }

    /// Emits a statistics report every ten seconds, forever.
    pub async fn report_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the window has data.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let elapsed_minutes = (self.start_time.elapsed().as_secs() / 60) as i64;
            let mut inner = self.inner.lock().await;
            slide_window(&mut inner.events_sliding_window);

            // Until enough history exists, rate over N minutes uses what is
            // there.
            let window_3 = (elapsed_minutes + 1).min(3);
            let window_10 = (elapsed_minutes + 1).min(10);
            let rate_3m = ingestion_rate_per_minute(&inner.events_sliding_window, window_3);
            let rate_10m = ingestion_rate_per_minute(&inner.events_sliding_window, window_10);

            info!(
                total_imported_events = inner.total_events_imported,
                events_imported_this_run = inner.current_run_imported,
                ingestion_rate_3m_per_sec = rate_3m / 60,
                ingestion_rate_10m_per_sec = rate_10m / 60,
                elapsed_minutes,
                remaining_events = inner.remaining_events,
                estimated_catch_up_secs =
                    inner.catch_up_estimate.map(|d| d.as_secs()).unwrap_or(0),
                "stream import statistics"
            );
        }
    }
}

/// Shifts every bucket one slot towards the tail and opens a fresh head.
fn slide_window(window: &mut [i64; WINDOW_SLOTS]) {
    for i in (1..WINDOW_SLOTS).rev() {
        window[i] = window[i - 1];
    }
    window[0] = 0;
}

/// Events per minute over the last `minutes` full buckets. The open head
/// bucket is excluded.
fn ingestion_rate_per_minute(window: &[i64; WINDOW_SLOTS], minutes: i64) -> i64 {
    let minutes = minutes.clamp(1, 10);
    let slots = (6 * minutes) as usize;

    window[1..=slots].iter().sum::<i64>() / minutes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batches_accumulate_into_the_open_bucket() {
        let reporter = StreamImportStatsReporter::new(Uuid::new_v4());
        reporter
            .batch_imported(&EventCounts {
                num_inserts: 10,
                num_updates: 5,
                num_deletes: 1,
            })
            .await;

        let inner = reporter.inner.lock().await;
        assert_eq!(inner.total_events_imported, 16);
        assert_eq!(inner.current_run_imported, 16);
        assert_eq!(inner.events_sliding_window[0], 16);
    }

    #[test]
    fn rate_counts_full_buckets_only() {
        let mut window = [0i64; WINDOW_SLOTS];
        // 600 events in the open bucket must not count yet.
        window[0] = 600;
        assert_eq!(ingestion_rate_per_minute(&window, 1), 0);

        slide_window(&mut window);
        assert_eq!(window[0], 0);
        assert_eq!(window[1], 600);
        assert_eq!(ingestion_rate_per_minute(&window, 1), 600);
    }

    #[test]
    fn rate_averages_over_the_requested_minutes() {
        let mut window = [0i64; WINDOW_SLOTS];
        // 100 events in each of the last 18 buckets: three minutes of
        // history.
        for slot in 1..=18 {
            window[slot] = 100;
        }

        assert_eq!(ingestion_rate_per_minute(&window, 1), 600);
        assert_eq!(ingestion_rate_per_minute(&window, 3), 600);
        // The ten-minute average sees seven empty minutes.
        assert_eq!(ingestion_rate_per_minute(&window, 10), 180);
    }

    #[test]
    fn window_drops_buckets_older_than_ten_minutes() {
        let mut window = [0i64; WINDOW_SLOTS];
        window[0] = 42;

        for _ in 0..WINDOW_SLOTS {
            slide_window(&mut window);
        }

        assert_eq!(window.iter().sum::<i64>(), 0);
    }

    #[tokio::test]
    async fn remaining_events_and_catch_up_estimate() {
        let reporter = StreamImportStatsReporter::new(Uuid::new_v4());
        reporter
            .batch_imported(&EventCounts {
                num_inserts: 600,
                num_updates: 0,
                num_deletes: 0,
            })
            .await;

        {
            let mut inner = reporter.inner.lock().await;
            slide_window(&mut inner.events_sliding_window);
        }

        reporter.update_remaining_events(1800).await;

        let inner = reporter.inner.lock().await;
        assert_eq!(inner.remaining_events, 1200);
        // 1200 remaining at 600 events/min is two minutes.
        assert_eq!(inner.catch_up_estimate, Some(Duration::from_secs(120)));
    }
}
