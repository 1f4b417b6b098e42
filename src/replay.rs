//! Offline replay of a recorded capture through the correlator.
//!
//! A capture is a JSON-lines file. Each line is one [`CaptureEvent`] and the
//! events are fed to the correlator in file order:
//!
//! ```text
//! {"kind":"string","handle":7,"value":"gfx"}
//! {"kind":"job","thread_id":12,"amdgpu_cs_ioctl_ts":15,"gpu_hw_start_ts":1000,"timeline_handle":7,"depth":0}
//! {"kind":"submission","thread_id":12,"process_id":3,"pre_submission_cpu_ts":10,"post_submission_cpu_ts":20,...}
//! ```

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::correlator::{CorrelatorConfig, PendingCounts, SubmissionCorrelator};
use crate::strings::InternedStrings;
use crate::types::{CpuSubmission, GpuJob, StringHandle, TimerSlice};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// Registers `value` under `handle` in the intern table.
    String { handle: StringHandle, value: String },
    Submission(CpuSubmission),
    Job(GpuJob),
}

#[derive(Debug)]
pub struct ReplayOutput {
    /// Every emitted slice, in emission order.
    pub slices: Vec<TimerSlice>,
    /// The intern table after replay, including handles created by the correlator.
    pub strings: InternedStrings,
    /// What was still pending when the capture ended.
    pub pending: PendingCounts,
}

/// Parse one line of a capture file. Blank lines yield `None`.
pub fn parse_event(line: &str) -> Result<Option<CaptureEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str(line)?;
    Ok(Some(event))
}

pub fn replay_capture<R: BufRead>(reader: R, config: CorrelatorConfig) -> Result<ReplayOutput> {
    let mut correlator = SubmissionCorrelator::new(config);
    let mut strings = InternedStrings::new();
    let mut slices = Vec::new();
    let mut num_events = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read capture line {}", index + 1))?;
        let Some(event) = parse_event(&line)
            .with_context(|| format!("Invalid capture event on line {}", index + 1))?
        else {
            continue;
        };
        num_events += 1;

        match event {
            CaptureEvent::String { handle, value } => strings.insert(handle, value),
            CaptureEvent::Submission(submission) => {
                slices.extend(correlator.on_cpu_submission(submission, &mut strings));
            }
            CaptureEvent::Job(job) => {
                slices.extend(correlator.on_gpu_job(job, &mut strings));
            }
        }
    }

    debug!("Replayed {num_events} capture events");
    let pending = correlator.finish();
    info!("Correlated {} slices", slices.len());

    Ok(ReplayOutput {
        slices,
        strings,
        pending,
    })
}

/// Write slices as JSON lines.
pub fn write_slices<W: Write>(mut writer: W, slices: &[TimerSlice]) -> Result<()> {
    for slice in slices {
        serde_json::to_writer(&mut writer, slice).context("Failed to serialize slice")?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
