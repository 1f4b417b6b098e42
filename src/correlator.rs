//! Joins CPU-side queue submissions with the kernel's GPU jobs.
//!
//! A `CpuSubmission` and a `GpuJob` match when they come from the same thread
//! and the job's `amdgpu_cs_ioctl` timestamp falls inside the submission's
//! pre/post interval. Either side may arrive first, so both are parked in
//! per-thread pending tables until their counterpart shows up.
//!
//! Debug markers complicate retention: a marker may begin in one submission
//! and end in a later one. The begin submission (and its job) is needed to
//! convert the begin timestamp, so both stay pending until every begin marker
//! they recorded has been closed.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, error, warn};

use crate::strings::StringTable;
use crate::types::{
    CommandBuffer, CpuSubmission, GpuJob, SliceType, TimerSlice, Timestamp, COMMAND_BUFFER_LABEL,
    UNKNOWN_THREAD_ID,
};

const DXVK_LABEL_PREFIX: &str = "DXVK__";

/// Configuration recognized by [`SubmissionCorrelator`].
#[derive(Debug, Clone, Default)]
pub struct CorrelatorConfig {
    /// Used whenever a begin event is known to exist but was never observed.
    pub begin_capture_cpu_ts: Timestamp,
}

/// Sizes of the pending tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub submissions: usize,
    pub jobs: usize,
    pub open_marker_entries: usize,
}

impl PendingCounts {
    pub fn is_empty(&self) -> bool {
        self.submissions == 0 && self.jobs == 0 && self.open_marker_entries == 0
    }
}

/// A begin marker whose end has been processed, to be released once the
/// current submission is fully handled.
struct BeginMarkerRelease {
    thread_id: i32,
    job_ts: Timestamp,
    post_submission_cpu_ts: Timestamp,
}

/// Where a marker's begin timestamp gets converted from.
struct BeginAnchor {
    command_buffer: Option<CommandBuffer>,
    job: Option<GpuJob>,
}

#[derive(Debug, Clone, Default)]
pub struct SubmissionCorrelator {
    begin_capture_cpu_ts: Timestamp,
    // tid -> post_submission_cpu_ts -> submission
    pending_submissions: HashMap<i32, BTreeMap<Timestamp, CpuSubmission>>,
    // tid -> amdgpu_cs_ioctl_ts -> job
    pending_jobs: HashMap<i32, BTreeMap<Timestamp, GpuJob>>,
    // tid -> post_submission_cpu_ts -> begin markers still waiting for their end.
    // An entry only exists while its count is non-zero.
    open_marker_counts: HashMap<i32, BTreeMap<Timestamp, u32>>,
}

impl SubmissionCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            begin_capture_cpu_ts: config.begin_capture_cpu_ts,
            ..Default::default()
        }
    }

    pub fn begin_capture_cpu_ts(&self) -> Timestamp {
        self.begin_capture_cpu_ts
    }

    /// Handle a submission reported by the Vulkan layer.
    ///
    /// Submissions of a thread must arrive ordered by `post_submission_cpu_ts`.
    pub fn on_cpu_submission(
        &mut self,
        submission: CpuSubmission,
        strings: &mut dyn StringTable,
    ) -> Vec<TimerSlice> {
        let thread_id = submission.thread_id;
        let post_ts = submission.post_submission_cpu_ts;
        let matching_job = self
            .find_matching_job(thread_id, submission.pre_submission_cpu_ts, post_ts)
            .copied();

        if submission.num_begin_markers > 0 {
            self.open_marker_counts
                .entry(thread_id)
                .or_default()
                .insert(post_ts, submission.num_begin_markers);
        }

        let Some(job) = matching_job else {
            self.store_submission(submission);
            return Vec::new();
        };

        let slices = self.process_matched_pair(&submission, &job, strings);

        if self.has_open_begin_markers(thread_id, post_ts) {
            self.store_submission(submission);
        } else {
            self.remove_job(thread_id, job.amdgpu_cs_ioctl_ts);
        }
        slices
    }

    /// Handle a job reported by the `amdgpu_cs_ioctl` tracepoint.
    ///
    /// Jobs of a thread must arrive ordered by `amdgpu_cs_ioctl_ts`.
    pub fn on_gpu_job(&mut self, job: GpuJob, strings: &mut dyn StringTable) -> Vec<TimerSlice> {
        let thread_id = job.thread_id;
        let Some(post_ts) = self
            .find_matching_submission(thread_id, job.amdgpu_cs_ioctl_ts)
            .map(|submission| submission.post_submission_cpu_ts)
        else {
            self.store_job(job);
            return Vec::new();
        };

        // Take the submission out while it is processed. A marker beginning in
        // this very submission is recognized by `is_origin_of`, never looked up.
        let Some(submission) = self.remove_submission(thread_id, post_ts) else {
            self.store_job(job);
            return Vec::new();
        };

        let slices = self.process_matched_pair(&submission, &job, strings);

        if self.has_open_begin_markers(thread_id, post_ts) {
            self.store_submission(submission);
            self.store_job(job);
        }
        slices
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            submissions: self.pending_submissions.values().map(BTreeMap::len).sum(),
            jobs: self.pending_jobs.values().map(BTreeMap::len).sum(),
            open_marker_entries: self.open_marker_counts.values().map(BTreeMap::len).sum(),
        }
    }

    /// End of capture. Anything still pending will never be emitted.
    pub fn finish(self) -> PendingCounts {
        let counts = self.pending_counts();
        if !counts.is_empty() {
            warn!(
                "Capture ended with {} submission(s), {} job(s) and {} open begin marker entries pending",
                counts.submissions, counts.jobs, counts.open_marker_entries
            );
        }
        counts
    }

    /// First pending submission of `thread_id` whose post timestamp is at or
    /// after `ts`, provided its pre timestamp is not after `ts`.
    fn find_matching_submission(&self, thread_id: i32, ts: Timestamp) -> Option<&CpuSubmission> {
        let submissions = self.pending_submissions.get(&thread_id)?;
        let (_, submission) = submissions.range(ts..).next()?;
        (submission.pre_submission_cpu_ts <= ts).then_some(submission)
    }

    /// The single pending job of `thread_id` inside `[pre_ts, post_ts]`.
    fn find_matching_job(
        &self,
        thread_id: i32,
        pre_ts: Timestamp,
        post_ts: Timestamp,
    ) -> Option<&GpuJob> {
        let jobs = self.pending_jobs.get(&thread_id)?;
        let (first_ts, _) = jobs.range(pre_ts..).next()?;
        let (last_ts, job) = jobs.range(..=post_ts).next_back()?;
        (first_ts == last_ts).then_some(job)
    }

    fn process_matched_pair(
        &mut self,
        submission: &CpuSubmission,
        job: &GpuJob,
        strings: &mut dyn StringTable,
    ) -> Vec<TimerSlice> {
        // The first command buffer aligns GPU time with the CPU clock. Without
        // its begin timestamp nothing in this submission can be placed.
        let anchor = submission
            .first_command_buffer()
            .copied()
            .filter(|command_buffer| command_buffer.begin_gpu_ts != 0);
        let Some(first_command_buffer) = anchor else {
            debug!(
                "Discarding submission of thread {} at {}: no anchor command buffer",
                submission.thread_id, submission.post_submission_cpu_ts
            );
            self.release_begin_markers_of_dropped(submission, job);
            return Vec::new();
        };

        let mut slices =
            self.command_buffer_slices(submission, job, &first_command_buffer, strings);
        slices.extend(self.debug_marker_slices(submission, job, &first_command_buffer, strings));
        slices
    }

    fn command_buffer_slices(
        &self,
        submission: &CpuSubmission,
        job: &GpuJob,
        first_command_buffer: &CommandBuffer,
        strings: &mut dyn StringTable,
    ) -> Vec<TimerSlice> {
        let label = strings.get_or_create(COMMAND_BUFFER_LABEL);
        let anchor_gpu_ts = first_command_buffer.begin_gpu_ts;

        submission
            .command_buffers()
            .map(|command_buffer| {
                let start_cpu_ts = if command_buffer.begin_gpu_ts == 0 {
                    self.begin_capture_cpu_ts
                } else {
                    gpu_to_cpu_ts(command_buffer.begin_gpu_ts, anchor_gpu_ts, job.gpu_hw_start_ts)
                };
                TimerSlice {
                    slice_type: SliceType::CommandBuffer,
                    start_cpu_ts,
                    end_cpu_ts: gpu_to_cpu_ts(
                        command_buffer.end_gpu_ts,
                        anchor_gpu_ts,
                        job.gpu_hw_start_ts,
                    ),
                    depth: job.depth,
                    timeline_handle: job.timeline_handle,
                    thread_id: submission.thread_id,
                    process_id: submission.process_id,
                    user_data_handle: label,
                    color: None,
                    group_id: None,
                }
            })
            .collect()
    }

    fn debug_marker_slices(
        &mut self,
        submission: &CpuSubmission,
        job: &GpuJob,
        first_command_buffer: &CommandBuffer,
        strings: &dyn StringTable,
    ) -> Vec<TimerSlice> {
        let mut slices = Vec::with_capacity(submission.completed_markers.len());
        // Releasing a begin marker may free its submission, which can be the
        // one being processed. Collect and release after the loop.
        let mut releases = Vec::new();

        for marker in &submission.completed_markers {
            let (start_cpu_ts, thread_id) = match &marker.begin {
                None => (self.begin_capture_cpu_ts, UNKNOWN_THREAD_ID),
                Some(origin) => {
                    let begin = if submission.is_origin_of(origin) {
                        BeginAnchor {
                            command_buffer: Some(*first_command_buffer),
                            job: Some(*job),
                        }
                    } else {
                        // Submissions without command buffer timers may have been
                        // dropped upstream, taking the begin with them.
                        let Some(begin_submission) = self.find_matching_submission(
                            origin.thread_id,
                            origin.post_submission_cpu_ts,
                        ) else {
                            error!(
                                "Discarding debug marker: begin submission of thread {} at {} is gone",
                                origin.thread_id, origin.post_submission_cpu_ts
                            );
                            continue;
                        };
                        BeginAnchor {
                            command_buffer: begin_submission
                                .first_command_buffer()
                                .copied()
                                .filter(|command_buffer| command_buffer.begin_gpu_ts != 0),
                            job: self
                                .find_matching_job(
                                    origin.thread_id,
                                    origin.pre_submission_cpu_ts,
                                    origin.post_submission_cpu_ts,
                                )
                                .copied(),
                        }
                    };

                    let start_cpu_ts = match (&begin.command_buffer, &begin.job) {
                        (Some(command_buffer), Some(begin_job)) => gpu_to_cpu_ts(
                            origin.gpu_ts,
                            command_buffer.begin_gpu_ts,
                            begin_job.gpu_hw_start_ts,
                        ),
                        _ => self.begin_capture_cpu_ts,
                    };

                    releases.push(BeginMarkerRelease {
                        thread_id: origin.thread_id,
                        job_ts: begin.job.map_or(0, |begin_job| begin_job.amdgpu_cs_ioctl_ts),
                        post_submission_cpu_ts: origin.post_submission_cpu_ts,
                    });

                    let thread_id = if origin.thread_id == submission.thread_id {
                        origin.thread_id
                    } else {
                        UNKNOWN_THREAD_ID
                    };
                    (start_cpu_ts, thread_id)
                }
            };

            let group_id = match strings.resolve(marker.text_handle) {
                Some(text) => extract_dxvk_group_id(text),
                None => {
                    debug!("Debug marker text handle {} is not interned", marker.text_handle);
                    None
                }
            };

            slices.push(TimerSlice {
                slice_type: SliceType::DebugMarker,
                start_cpu_ts,
                end_cpu_ts: gpu_to_cpu_ts(
                    marker.end_gpu_ts,
                    first_command_buffer.begin_gpu_ts,
                    job.gpu_hw_start_ts,
                ),
                depth: marker.depth,
                timeline_handle: job.timeline_handle,
                thread_id,
                process_id: submission.process_id,
                user_data_handle: marker.text_handle,
                color: marker.color.map(|color| color.to_rgba8()),
                group_id,
            });
        }

        for release in releases {
            self.release_begin_marker(release);
        }
        slices
    }

    /// Release every begin marker closed by a discarded submission, so neither
    /// its begin submissions nor the discarded one stay pending for the whole
    /// capture.
    fn release_begin_markers_of_dropped(&mut self, submission: &CpuSubmission, job: &GpuJob) {
        let releases: Vec<_> = submission
            .completed_markers
            .iter()
            .filter_map(|marker| marker.begin.as_ref())
            .map(|origin| BeginMarkerRelease {
                thread_id: origin.thread_id,
                job_ts: if submission.is_origin_of(origin) {
                    job.amdgpu_cs_ioctl_ts
                } else {
                    self.find_matching_job(
                        origin.thread_id,
                        origin.pre_submission_cpu_ts,
                        origin.post_submission_cpu_ts,
                    )
                    .map_or(0, |begin_job| begin_job.amdgpu_cs_ioctl_ts)
                },
                post_submission_cpu_ts: origin.post_submission_cpu_ts,
            })
            .collect();

        for release in releases {
            self.release_begin_marker(release);
        }
    }

    fn release_begin_marker(&mut self, release: BeginMarkerRelease) {
        let BeginMarkerRelease {
            thread_id,
            job_ts,
            post_submission_cpu_ts,
        } = release;

        let Some(counts) = self.open_marker_counts.get_mut(&thread_id) else {
            debug!("No open begin markers for thread {thread_id}");
            return;
        };
        let Some(count) = counts.get_mut(&post_submission_cpu_ts) else {
            debug!(
                "No open begin markers for submission of thread {thread_id} at {post_submission_cpu_ts}"
            );
            return;
        };

        *count -= 1;
        if *count > 0 {
            return;
        }

        counts.remove(&post_submission_cpu_ts);
        if counts.is_empty() {
            self.open_marker_counts.remove(&thread_id);
        }
        self.remove_job(thread_id, job_ts);
        self.remove_submission(thread_id, post_submission_cpu_ts);
    }

    fn has_open_begin_markers(&self, thread_id: i32, post_ts: Timestamp) -> bool {
        self.open_marker_counts
            .get(&thread_id)
            .is_some_and(|counts| counts.contains_key(&post_ts))
    }

    fn store_submission(&mut self, submission: CpuSubmission) {
        self.pending_submissions
            .entry(submission.thread_id)
            .or_default()
            .insert(submission.post_submission_cpu_ts, submission);
    }

    fn store_job(&mut self, job: GpuJob) {
        self.pending_jobs
            .entry(job.thread_id)
            .or_default()
            .insert(job.amdgpu_cs_ioctl_ts, job);
    }

    fn remove_submission(&mut self, thread_id: i32, post_ts: Timestamp) -> Option<CpuSubmission> {
        let submissions = self.pending_submissions.get_mut(&thread_id)?;
        let removed = submissions.remove(&post_ts);
        if submissions.is_empty() {
            self.pending_submissions.remove(&thread_id);
        }
        removed
    }

    fn remove_job(&mut self, thread_id: i32, ioctl_ts: Timestamp) -> Option<GpuJob> {
        let jobs = self.pending_jobs.get_mut(&thread_id)?;
        let removed = jobs.remove(&ioctl_ts);
        if jobs.is_empty() {
            self.pending_jobs.remove(&thread_id);
        }
        removed
    }
}

/// Convert a GPU timestamp to the CPU clock, assuming the anchor command
/// buffer started executing exactly at `gpu_hw_start_ts`.
fn gpu_to_cpu_ts(
    gpu_ts: Timestamp,
    anchor_gpu_ts: Timestamp,
    gpu_hw_start_ts: Timestamp,
) -> Timestamp {
    // Intermediate values may underflow when gpu_ts precedes the anchor.
    gpu_ts
        .wrapping_sub(anchor_gpu_ts)
        .wrapping_add(gpu_hw_start_ts)
}

/// DXVK encodes a group id in its labels as `DXVK__vkFunctionName#GROUP_ID`.
pub fn extract_dxvk_group_id(label: &str) -> Option<u64> {
    if !label.contains(DXVK_LABEL_PREFIX) {
        return None;
    }
    let (_, digits) = label.rsplit_once('#')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
