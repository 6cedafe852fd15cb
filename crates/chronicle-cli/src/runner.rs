//! NDJSON runner
//!
//! Reads one JSON object per line, feeds the sharded engine and writes
//! per-event outcomes (and optionally the final target) as JSON lines.
//! Outcomes are written in input order.

use anyhow::{Context, Result};
use chronicle::{
    MaterializeStatsSnapshot, ParallelConfig, PipelineDescription, RawEvent, ReportHandle,
    ShardedMaterializer,
};
use clap::ValueEnum;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// What to write to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// One outcome record per event
    Outcomes,
    /// The final target snapshot only
    State,
    /// Outcome records followed by the snapshot
    Both,
}

impl OutputMode {
    fn outcomes(&self) -> bool {
        matches!(self, OutputMode::Outcomes | OutputMode::Both)
    }

    fn state(&self) -> bool {
        matches!(self, OutputMode::State | OutputMode::Both)
    }
}

/// Runner settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub shards: usize,
    pub channel_capacity: usize,
    pub output: OutputMode,
}

/// Totals for a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Input lines read
    pub lines: u64,
    /// Lines that were not JSON objects
    pub skipped: u64,
    pub stats: MaterializeStatsSnapshot,
}

/// Materialize every event from `input`, writing results to `output`.
pub async fn run<R, W>(
    description: PipelineDescription,
    input: R,
    output: &mut W,
    options: &RunOptions,
) -> Result<RunSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let config = ParallelConfig::default()
        .with_shards(options.shards)
        .with_channel_capacity(options.channel_capacity);
    let engine = ShardedMaterializer::spawn(description, config)?;

    // Bound the number of events awaiting an outcome
    let window = (options.shards * options.channel_capacity).max(1);
    let mut pending: VecDeque<ReportHandle> = VecDeque::with_capacity(window);
    let mut lines = input.lines();
    let mut line_no = 0u64;
    let mut skipped = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read events")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = match parse_event(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping line {}: {:#}", line_no, e);
                skipped += 1;
                continue;
            }
        };

        pending.push_back(engine.dispatch(event).await?);
        while pending.len() >= window {
            if let Some(handle) = pending.pop_front() {
                emit(handle, output, options.output).await?;
            }
        }
    }

    while let Some(handle) = pending.pop_front() {
        emit(handle, output, options.output).await?;
    }

    if options.output.state() {
        let snapshot = engine.snapshot().await?;
        debug!("Writing snapshot with {} rows", snapshot.row_count());
        write_json_line(output, &snapshot).await?;
    }
    output.flush().await?;

    let stats = engine.stats();
    engine.shutdown().await?;

    Ok(RunSummary {
        lines: line_no,
        skipped,
        stats,
    })
}

fn parse_event(line: &str) -> Result<RawEvent> {
    let value: serde_json::Value = serde_json::from_str(line).context("Invalid JSON")?;
    Ok(RawEvent::from_json(value)?)
}

async fn emit<W: AsyncWrite + Unpin>(handle: ReportHandle, output: &mut W, mode: OutputMode) -> Result<()> {
    let report = handle.wait().await?;
    if mode.outcomes() {
        write_json_line(output, &report).await?;
    }
    Ok(())
}

async fn write_json_line<W: AsyncWrite + Unpin, T: Serialize>(output: &mut W, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await.context("Failed to write output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle::MaterializationPolicy;

    fn description() -> PipelineDescription {
        PipelineDescription::new("members", MaterializationPolicy::Type2)
            .with_natural_key(["member_id"])
            .with_sequence_fields(["lsn"])
    }

    fn options(output: OutputMode) -> RunOptions {
        RunOptions {
            shards: 2,
            channel_capacity: 2,
            output,
        }
    }

    const INPUT: &str = r#"{"member_id": 1, "lsn": 10, "tier": "silver"}
{"member_id": 2, "lsn": 5, "tier": "gold"}

not json
{"member_id": 1, "lsn": 30, "tier": "gold"}
{"member_id": 1, "lsn": 20, "tier": "bronze"}
{"member_id": 1, "tier": "unknown"}
"#;

    #[tokio::test]
    async fn test_outcomes_in_input_order() {
        let mut output = Vec::new();
        let summary = run(description(), INPUT.as_bytes(), &mut output, &options(OutputMode::Outcomes))
            .await
            .unwrap();

        let lines: Vec<serde_json::Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let reasons: Vec<_> = lines.iter().map(|l| l["reason"].as_str().unwrap_or("")).collect();
        assert_eq!(reasons[..4], ["history_appended", "history_appended", "history_appended", "history_backfilled"]);
        assert_eq!(lines[4]["code"], "unorderable_event");
        let arrivals: Vec<_> = lines.iter().map(|l| l["arrival"].as_u64().unwrap()).collect();
        assert_eq!(arrivals, vec![0, 1, 2, 3, 4]);

        assert_eq!(summary.lines, 7);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.stats.events_applied, 4);
        assert_eq!(summary.stats.rejected_unorderable, 1);
    }

    #[tokio::test]
    async fn test_state_output() {
        let mut output = Vec::new();
        run(description(), INPUT.as_bytes(), &mut output, &options(OutputMode::State))
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.lines().count(), 1);
        let snapshot: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(snapshot["policy"], "type2");
        let keys = snapshot["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0]["versions"].as_array().unwrap().len(), 3);
    }
}
