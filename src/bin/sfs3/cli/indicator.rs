use std::collections::HashMap;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use async_channel::Receiver;
use indicatif::{
    HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle,
};
use sfs3::progress::{ProgressAggregator, ProgressSnapshot, SlotLine};
use sfs3::types::{TransferId, TransferStatistics};
use tokio::task::JoinHandle;

const REFRESH_INTERVAL: f32 = 1.0;
const POLL_INTERVAL_MILLIS: u64 = 50;

/// Drains transfer events once per second and renders one line per active
/// slot plus a totals line. On a terminal the previously drawn block is
/// cleared before each redraw; elsewhere the display degrades to plain
/// lines. Per-file START/DONE/SKIP/ABORT lines go to stderr as they happen.
pub fn show_indicator(
    stats_receiver: Receiver<TransferStatistics>,
    show_progress: bool,
    quiet: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let is_terminal = std::io::stderr().is_terminal();
        let draw_progress = show_progress && is_terminal;

        let mut aggregator = ProgressAggregator::new(stats_receiver);

        let multi = MultiProgress::with_draw_target(if draw_progress {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        });
        let line_style = ProgressStyle::with_template("{wide_msg}").unwrap();
        let totals_bar = multi.add(ProgressBar::new(0));
        totals_bar.set_style(line_style.clone());
        let mut slot_bars: HashMap<TransferId, ProgressBar> = HashMap::new();

        loop {
            let period = Instant::now();
            let mut finished = false;

            loop {
                let now = Instant::now();
                aggregator.drain_with(now, |event| {
                    handle_event(
                        event,
                        quiet,
                        draw_progress,
                        &multi,
                        &totals_bar,
                        &line_style,
                        &mut slot_bars,
                    );
                });

                if aggregator.is_finished() {
                    finished = true;
                    break;
                }

                if REFRESH_INTERVAL < period.elapsed().as_secs_f32() {
                    break;
                }

                tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MILLIS)).await;
            }

            let snapshot = aggregator.snapshot(Instant::now());

            if finished {
                for bar in slot_bars.values() {
                    bar.finish_and_clear();
                }
                totals_bar.finish_and_clear();
                return;
            }

            if draw_progress {
                for slot in &snapshot.slots {
                    if let Some(bar) = slot_bars.get(&slot.id) {
                        bar.set_message(format_slot_line(slot));
                    }
                }
                totals_bar.set_message(format_totals(&snapshot));
            } else if show_progress && !snapshot.slots.is_empty() {
                eprintln!("{}", format_totals(&snapshot));
            }
        }
    })
}

fn handle_event(
    event: &TransferStatistics,
    quiet: bool,
    draw_progress: bool,
    multi: &MultiProgress,
    totals_bar: &ProgressBar,
    line_style: &ProgressStyle,
    slot_bars: &mut HashMap<TransferId, ProgressBar>,
) {
    match event {
        TransferStatistics::TransferStart { id, key, .. } => {
            print_event_line(multi, draw_progress, quiet, &format!("START {key}"));
            if draw_progress {
                let bar = multi.insert_before(totals_bar, ProgressBar::new(0));
                bar.set_style(line_style.clone());
                bar.set_message(key.clone());
                slot_bars.insert(*id, bar);
            }
        }
        TransferStatistics::TransferComplete { id, key, .. } => {
            remove_slot_bar(multi, slot_bars, *id);
            print_event_line(multi, draw_progress, quiet, &format!("DONE {key}"));
        }
        TransferStatistics::TransferSkip { id, key, .. } => {
            remove_slot_bar(multi, slot_bars, *id);
            print_event_line(multi, draw_progress, quiet, &format!("SKIP {key}"));
        }
        TransferStatistics::TransferAbort { id, key, .. } => {
            remove_slot_bar(multi, slot_bars, *id);
            // Failures are printed even in quiet mode.
            print_event_line(multi, draw_progress, false, &format!("ABORT {key}"));
        }
        TransferStatistics::TransferBytes { .. } | TransferStatistics::TotalDiscovered { .. } => {}
    }
}

fn remove_slot_bar(
    multi: &MultiProgress,
    slot_bars: &mut HashMap<TransferId, ProgressBar>,
    id: TransferId,
) {
    if let Some(bar) = slot_bars.remove(&id) {
        bar.finish_and_clear();
        multi.remove(&bar);
    }
}

fn print_event_line(multi: &MultiProgress, draw_progress: bool, quiet: bool, line: &str) {
    if quiet {
        return;
    }

    if draw_progress {
        let _ = multi.println(line);
    } else {
        eprintln!("{line}");
    }
}

fn format_slot_line(slot: &SlotLine) -> String {
    format!(
        "{:>10} / {:>10}  {}",
        HumanBytes(slot.done_bytes).to_string(),
        HumanBytes(slot.total_bytes).to_string(),
        slot.key
    )
}

fn format_totals(snapshot: &ProgressSnapshot) -> String {
    let eta = snapshot
        .eta
        .map(|eta| HumanDuration(eta).to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{}/{} files,  {} / {},  {}/s,  ETA {}",
        snapshot.completed_files,
        snapshot.total_files,
        HumanBytes(snapshot.completed_bytes),
        HumanBytes(snapshot.total_bytes),
        HumanBytes(snapshot.rate_bytes_per_sec as u64),
        eta,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn indicator_drains_until_channel_closes() {
        let (stats_sender, stats_receiver) = async_channel::unbounded();
        let join_handle = show_indicator(stats_receiver, true, false);

        stats_sender
            .send(TransferStatistics::TotalDiscovered { files: 1, bytes: 3 })
            .await
            .unwrap();
        stats_sender
            .send(TransferStatistics::TransferStart {
                id: 1,
                key: "test".to_string(),
                total_bytes: 3,
            })
            .await
            .unwrap();
        stats_sender
            .send(TransferStatistics::TransferBytes { id: 1, bytes: 3 })
            .await
            .unwrap();
        stats_sender
            .send(TransferStatistics::TransferComplete {
                id: 1,
                key: "test".to_string(),
                bytes: 3,
            })
            .await
            .unwrap();

        stats_sender.close();
        join_handle.await.unwrap();
    }

    #[test]
    fn totals_line_contains_counts_and_eta() {
        let snapshot = ProgressSnapshot {
            total_files: 4,
            total_bytes: 400,
            completed_files: 2,
            completed_bytes: 200,
            rate_bytes_per_sec: 100.0,
            eta: Some(Duration::from_secs(2)),
            ..Default::default()
        };

        let line = format_totals(&snapshot);
        assert!(line.contains("2/4 files"));
        assert!(line.contains("ETA"));
    }
}
