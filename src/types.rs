//! Value types exchanged with the submission correlator.
//!
//! Inputs mirror what the Vulkan layer (`CpuSubmission`) and the
//! `amdgpu_cs_ioctl` tracepoints (`GpuJob`) report. Outputs are
//! [`TimerSlice`]s on the CPU clock, ready to be placed on a GPU timeline.

use serde::{Deserialize, Serialize};

/// Nanoseconds on either the CPU or the GPU clock, depending on context.
pub type Timestamp = u64;

/// Key into the capture's string intern table.
pub type StringHandle = u64;

/// Thread id used for slices that cannot be attributed to a single thread.
pub const UNKNOWN_THREAD_ID: i32 = -1;

/// Label interned for every command buffer slice.
pub const COMMAND_BUFFER_LABEL: &str = "command buffer";

/// GPU timestamps of a single command buffer execution.
///
/// `begin_gpu_ts == 0` means the capture started while the command buffer
/// was already executing, so its begin was never observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBuffer {
    pub begin_gpu_ts: Timestamp,
    pub end_gpu_ts: Timestamp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitInfo {
    pub command_buffers: Vec<CommandBuffer>,
}

/// Identifies the submission in which a debug marker was begun.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerOrigin {
    pub thread_id: i32,
    pub pre_submission_cpu_ts: Timestamp,
    pub post_submission_cpu_ts: Timestamp,
    /// GPU timestamp of the begin marker.
    pub gpu_ts: Timestamp,
}

/// Normalized RGBA color as recorded by `vkCmdBeginDebugUtilsLabelEXT`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerColor {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub alpha: f32,
}

impl MarkerColor {
    pub fn to_rgba8(self) -> Color {
        // `as` saturates, so out-of-range components clamp to 0 or 255.
        Color {
            red: (self.red * 255.0) as u8,
            green: (self.green * 255.0) as u8,
            blue: (self.blue * 255.0) as u8,
            alpha: (self.alpha * 255.0) as u8,
        }
    }
}

/// A debug marker whose end was recorded in the submission carrying it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugMarker {
    /// Where the begin was recorded. `None` if it happened before the capture.
    #[serde(default)]
    pub begin: Option<MarkerOrigin>,
    pub end_gpu_ts: Timestamp,
    pub depth: u32,
    pub text_handle: StringHandle,
    #[serde(default)]
    pub color: Option<MarkerColor>,
}

/// CPU-side record of one `vkQueueSubmit`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuSubmission {
    pub thread_id: i32,
    pub process_id: i32,
    pub pre_submission_cpu_ts: Timestamp,
    pub post_submission_cpu_ts: Timestamp,
    #[serde(default)]
    pub submit_infos: Vec<SubmitInfo>,
    /// Begin markers recorded in this submission whose end has not been seen yet.
    #[serde(default)]
    pub num_begin_markers: u32,
    #[serde(default)]
    pub completed_markers: Vec<DebugMarker>,
}

impl CpuSubmission {
    /// All command buffers, in submission order across submit infos.
    pub fn command_buffers(&self) -> impl Iterator<Item = &CommandBuffer> {
        self.submit_infos
            .iter()
            .flat_map(|info| info.command_buffers.iter())
    }

    /// The command buffer used to align GPU timestamps with the CPU clock.
    pub fn first_command_buffer(&self) -> Option<&CommandBuffer> {
        self.command_buffers().next()
    }

    /// Whether `origin` points back at this very submission.
    pub fn is_origin_of(&self, origin: &MarkerOrigin) -> bool {
        self.thread_id == origin.thread_id
            && self.pre_submission_cpu_ts == origin.pre_submission_cpu_ts
            && self.post_submission_cpu_ts == origin.post_submission_cpu_ts
    }
}

/// Kernel-side record of a job emitted by `amdgpu_cs_ioctl`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuJob {
    pub thread_id: i32,
    /// CPU clock, inside the matching submission's pre/post interval.
    pub amdgpu_cs_ioctl_ts: Timestamp,
    /// CPU clock at which the hardware started executing the job.
    pub gpu_hw_start_ts: Timestamp,
    pub timeline_handle: StringHandle,
    pub depth: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceType {
    CommandBuffer,
    DebugMarker,
}

/// A time slice on the CPU clock, emitted for a matched submission/job pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSlice {
    #[serde(rename = "type")]
    pub slice_type: SliceType,
    pub start_cpu_ts: Timestamp,
    pub end_cpu_ts: Timestamp,
    pub depth: u32,
    pub timeline_handle: StringHandle,
    /// [`UNKNOWN_THREAD_ID`] when the slice spans threads or started before the capture.
    pub thread_id: i32,
    pub process_id: i32,
    pub user_data_handle: StringHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u64>,
}
