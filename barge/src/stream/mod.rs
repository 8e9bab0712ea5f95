//! Change streaming: partitions CDC events across parallel channels and
//! applies them transactionally with per-channel watermark tracking.
//!
//! Events for the same primary key always hash to the same channel, so they
//! apply in VSN order; there is no ordering across keys or tables. Redelivery
//! after a crash is safe because each worker drops events at or below its
//! channel's watermark and the adapter advances the watermark inside the same
//! transaction that applies a batch.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use barge_config::shared::{StreamConfig, TargetDbType};

use crate::bail;
use crate::error::{BargeResult, ErrorKind};
use crate::pipeline::ImportContext;
use crate::progress::StreamImportStatsReporter;
use crate::queue::{EventQueue, EventQueueSegment};
use crate::target::TargetDb;
use crate::types::{Event, EventBatch, EventOp};
use uuid::Uuid;

/// Poll interval while the next queue segment does not exist yet.
const SEGMENT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Streams captured changes into the target until a fatal error occurs.
///
/// Runs forever: once the queue is drained it waits for the exporter to
/// produce the next segment. Stopping the stream (cutover) is the caller's
/// concern.
pub async fn stream_changes(ctx: &ImportContext) -> BargeResult<()> {
    let config = &ctx.config.stream;
    info!(
        num_event_channels = config.num_event_channels,
        event_channel_size = config.event_channel_size,
        max_events_per_batch = config.max_events_per_batch,
        max_interval_between_batches_ms = config.max_interval_between_batches_ms,
        "starting change streaming"
    );

    let table_names: Vec<String> = ctx.table_columns.keys().cloned().collect();
    ctx.target
        .init_live_migration_state(
            ctx.migration_uuid,
            config.num_event_channels,
            ctx.config.start_clean,
            &table_names,
        )
        .await?;

    let meta_info = ctx
        .target
        .event_channels_meta_info(ctx.migration_uuid)
        .await?;
    let mut watermarks = Vec::with_capacity(config.num_event_channels);
    for channel_no in 0..config.num_event_channels {
        let Some(info) = meta_info.get(&(channel_no as i64)) else {
            bail!(
                ErrorKind::ChannelMetadataMissing,
                "No channel metadata row on the target",
                channel_no
            );
        };
        watermarks.push(info.last_applied_vsn);
    }

    let reporter = Arc::new(StreamImportStatsReporter::new(ctx.migration_uuid));
    reporter.init(&ctx.target).await?;
    tokio::spawn(reporter.clone().report_loop());
    tokio::spawn(poll_exported_events(ctx.state.clone(), reporter.clone()));

    let first_segment = ctx.state.first_unprocessed_segment().await?;
    let mut queue = EventQueue::new(&ctx.config.export_dir, first_segment);
    info!(queue_dir = %queue.queue_dir().display(), "streaming changes");

    loop {
        let Some(mut segment) = queue.next_segment() else {
            tokio::time::sleep(SEGMENT_POLL_INTERVAL).await;
            continue;
        };

        stream_changes_from_segment(ctx, &mut segment, &mut watermarks, &reporter).await?;

        ctx.state
            .mark_event_queue_segment_as_processed(segment.segment_num())
            .await?;
        info!(segment_num = segment.segment_num(), "finished streaming segment");
    }
}

/// Drains one segment through the channel workers.
///
/// Channels and workers live for exactly one segment; the per-channel
/// watermarks learned from applied batches carry over to the next one.
async fn stream_changes_from_segment(
    ctx: &ImportContext,
    segment: &mut EventQueueSegment,
    watermarks: &mut [i64],
    reporter: &Arc<StreamImportStatsReporter>,
) -> BargeResult<()> {
    segment.open().await?;
    let config = &ctx.config.stream;

    let mut senders = Vec::with_capacity(config.num_event_channels);
    let mut workers = JoinSet::new();
    for (channel_no, last_applied_vsn) in watermarks.iter().copied().enumerate() {
        let (tx, rx) = mpsc::channel(config.event_channel_size);
        senders.push(tx);

        workers.spawn(process_events(
            channel_no,
            rx,
            last_applied_vsn,
            ctx.target.clone(),
            ctx.migration_uuid,
            reporter.clone(),
            config.clone(),
        ));
    }

    debug!(segment_num = segment.segment_num(), "streaming changes for segment");
    while let Some(mut event) = segment.next_event().await? {
        let table = event.effective_table_name(ctx.source_db);
        let format_values = should_format_values(ctx.config.target.db_type, event.op);
        ctx.converter
            .convert_event(&mut event, &table, format_values)?;

        let channel_no = route_event(&event, config.num_event_channels);
        trace!(vsn = event.vsn, channel_no, "routed event");
        send_to_channel(&senders[channel_no], event).await?;
    }

    for sender in &senders {
        send_to_channel(sender, end_of_segment_event()).await?;
    }
    drop(senders);

    while let Some(joined) = workers.join_next().await {
        let (channel_no, last_applied_vsn) = joined.map_err(|err| {
            crate::barge_error!(ErrorKind::WorkerFailed, "Channel worker panicked")
                .with_source(err)
        })??;
        watermarks[channel_no] = last_applied_vsn;
    }

    Ok(())
}

async fn send_to_channel(sender: &mpsc::Sender<Event>, event: Event) -> BargeResult<()> {
    sender.send(event).await.map_err(|_| {
        crate::barge_error!(
            ErrorKind::WorkerFailed,
            "Channel worker stopped receiving events"
        )
    })
}

/// `true` iff the converter must emit embeddable literals for this event:
/// YugabyteDB updates are applied as literal statements, and everything on
/// Oracle goes through scripts.
fn should_format_values(target: TargetDbType, op: EventOp) -> bool {
    (target == TargetDbType::Yugabytedb && op == EventOp::Update)
        || target == TargetDbType::Oracle
}

/// Routes an event to a channel by hashing schema, table, and the primary key
/// values in sorted column order.
///
/// Sorting is what makes the hash stable regardless of how the key map was
/// built, so two events touching the same row always share a channel. With a
/// power-of-two channel count the modulo reduction is bias-free.
pub fn route_event(event: &Event, num_channels: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(event.schema_name.as_bytes());
    hasher.write(event.table_name.as_bytes());

    // BTreeMap iterates in sorted column order.
    for value in event.key.values().flatten() {
        hasher.write(value.as_bytes());
    }

    (hasher.finish() % num_channels as u64) as usize
}

fn end_of_segment_event() -> Event {
    Event {
        op: EventOp::EndOfSegment,
        vsn: 0,
        schema_name: String::new(),
        table_name: String::new(),
        key: BTreeMap::new(),
        fields: BTreeMap::new(),
    }
}

/// One channel worker: batches incoming events and applies each batch in a
/// single target transaction. Returns the channel's final watermark.
async fn process_events(
    channel_no: usize,
    mut rx: mpsc::Receiver<Event>,
    mut last_applied_vsn: i64,
    target: Arc<TargetDb>,
    migration_uuid: Uuid,
    reporter: Arc<StreamImportStatsReporter>,
    config: StreamConfig,
) -> BargeResult<(usize, i64)> {
    let max_interval = Duration::from_millis(config.max_interval_between_batches_ms);

    loop {
        let (events, end_of_segment) = collect_batch(
            &mut rx,
            last_applied_vsn,
            config.max_events_per_batch,
            max_interval,
        )
        .await;

        if !events.is_empty() {
            let batch = EventBatch::new(events, channel_no);
            let started = Instant::now();
            target.execute_batch(migration_uuid, &batch).await?;
            reporter.batch_imported(&batch.event_counts).await;
            last_applied_vsn = batch.max_vsn;

            debug!(
                channel_no,
                batch_size = batch.events.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "executed event batch"
            );
        }

        if end_of_segment {
            return Ok((channel_no, last_applied_vsn));
        }
    }
}

/// Gathers events from the channel until the batch is full, the interval
/// elapses, or the segment terminator arrives, whichever comes first.
///
/// Events at or below the channel watermark are dropped here; they were
/// already applied before a crash and redelivered.
pub(crate) async fn collect_batch(
    rx: &mut mpsc::Receiver<Event>,
    last_applied_vsn: i64,
    max_events: usize,
    max_interval: Duration,
) -> (Vec<Event>, bool) {
    let mut events = Vec::new();
    let deadline = Instant::now() + max_interval;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                None => return (events, true),
                Some(event) if event.is_end_of_segment() => return (events, true),
                Some(event) => {
                    if event.vsn <= last_applied_vsn {
                        trace!(vsn = event.vsn, last_applied_vsn, "dropping already applied event");
                        continue;
                    }

                    events.push(event);
                    if events.len() >= max_events {
                        return (events, false);
                    }
                }
            },
            _ = tokio::time::sleep_until(deadline) => return (events, false),
        }
    }
}

/// Refreshes the remaining-events figure from the exporter's counters every
/// ten seconds.
async fn poll_exported_events(
    state: crate::state::ImportDataState,
    reporter: Arc<StreamImportStatsReporter>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match state.total_exported_events().await {
            Ok(total_exported) => reporter.update_remaining_events(total_exported).await,
            Err(err) => {
                tracing::error!(error = %err, "failed to fetch exported events stats");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(vsn: i64, key_value: &str) -> Event {
        Event {
            op: EventOp::Update,
            vsn,
            schema_name: "public".to_string(),
            table_name: "orders".to_string(),
            key: BTreeMap::from([("id".to_string(), Some(key_value.to_string()))]),
            fields: BTreeMap::from([("total".to_string(), Some("1".to_string()))]),
        }
    }

    #[test]
    fn routing_is_stable_for_identical_keys() {
        // Same (schema, table, key) built in different insertion orders must
        // land on the same channel.
        let mut first = event(10, "7");
        first.key = BTreeMap::from([
            ("region".to_string(), Some("eu".to_string())),
            ("id".to_string(), Some("7".to_string())),
        ]);
        let mut second = event(99, "7");
        second.key = BTreeMap::from([
            ("id".to_string(), Some("7".to_string())),
            ("region".to_string(), Some("eu".to_string())),
        ]);

        assert_eq!(route_event(&first, 512), route_event(&second, 512));
    }

    #[test]
    fn routing_stays_in_range_and_spreads_keys() {
        let channels: Vec<usize> = (0..1000)
            .map(|i| route_event(&event(1, &i.to_string()), 512))
            .collect();

        assert!(channels.iter().all(|&c| c < 512));
        // Not all keys collapse onto one channel.
        let distinct: std::collections::HashSet<_> = channels.iter().collect();
        assert!(distinct.len() > 100);
    }

    #[test]
    fn formatting_rule_follows_target_and_op() {
        assert!(should_format_values(TargetDbType::Yugabytedb, EventOp::Update));
        assert!(!should_format_values(TargetDbType::Yugabytedb, EventOp::Insert));
        assert!(!should_format_values(TargetDbType::Yugabytedb, EventOp::Delete));
        assert!(should_format_values(TargetDbType::Oracle, EventOp::Insert));
        assert!(should_format_values(TargetDbType::Oracle, EventOp::Delete));
    }

    #[tokio::test]
    async fn batch_closes_when_full() {
        let (tx, mut rx) = mpsc::channel(16);
        for vsn in 1..=5 {
            tx.send(event(vsn, "7")).await.unwrap();
        }

        let (events, end) = collect_batch(&mut rx, 0, 3, Duration::from_secs(5)).await;
        assert_eq!(events.len(), 3);
        assert!(!end);

        let (events, end) = collect_batch(&mut rx, 0, 3, Duration::from_millis(20)).await;
        assert_eq!(events.len(), 2);
        assert!(!end);
    }

    #[tokio::test]
    async fn batch_closes_on_interval_elapse() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(event(1, "7")).await.unwrap();

        let (events, end) = collect_batch(&mut rx, 0, 100, Duration::from_millis(20)).await;
        assert_eq!(events.len(), 1);
        assert!(!end);
    }

    #[tokio::test]
    async fn terminator_flushes_the_open_batch() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(event(1, "7")).await.unwrap();
        tx.send(event(2, "7")).await.unwrap();
        tx.send(end_of_segment_event()).await.unwrap();

        let (events, end) = collect_batch(&mut rx, 0, 100, Duration::from_secs(5)).await;
        assert_eq!(events.len(), 2);
        assert!(end);
    }

    #[tokio::test]
    async fn redelivered_events_are_dropped_by_the_watermark() {
        let (tx, mut rx) = mpsc::channel(16);
        // VSNs 1..=4 were applied before the crash; the whole segment is
        // redelivered.
        for vsn in 1..=4 {
            tx.send(event(vsn, "7")).await.unwrap();
        }
        tx.send(end_of_segment_event()).await.unwrap();

        let (events, end) = collect_batch(&mut rx, 4, 100, Duration::from_secs(5)).await;
        assert!(events.is_empty());
        assert!(end);
    }

    #[tokio::test]
    async fn watermark_only_drops_at_or_below() {
        let (tx, mut rx) = mpsc::channel(16);
        for vsn in 1..=6 {
            tx.send(event(vsn, "7")).await.unwrap();
        }
        tx.send(end_of_segment_event()).await.unwrap();

        let (events, end) = collect_batch(&mut rx, 4, 100, Duration::from_secs(5)).await;
        assert_eq!(
            events.iter().map(|e| e.vsn).collect::<Vec<_>>(),
            vec![5, 6]
        );
        assert!(end);
    }
}
