//! Common test utilities for profjoin integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;

use profjoin::{
    CallchainSample, CaptureEvent, CommandBuffer, CpuSubmission, DebugMarker, GpuJob, MarkerColor,
    MarkerOrigin, MemoryMaps, MultiSliceMemory, ProcessMemory, Registers, StackSlice,
    StackSliceView, SubmitInfo, UnwindResult, Unwinder,
};
use tempfile::TempDir;

pub const THREAD_ID: i32 = 12;
pub const PROCESS_ID: i32 = 3;
pub const TIMELINE_HANDLE: u64 = 7;
pub const MARKER_TEXT_HANDLE: u64 = 20;

pub fn submission(pre: u64, post: u64, command_buffers: &[(u64, u64)]) -> CpuSubmission {
    CpuSubmission {
        thread_id: THREAD_ID,
        process_id: PROCESS_ID,
        pre_submission_cpu_ts: pre,
        post_submission_cpu_ts: post,
        submit_infos: vec![SubmitInfo {
            command_buffers: command_buffers
                .iter()
                .map(|&(begin_gpu_ts, end_gpu_ts)| CommandBuffer {
                    begin_gpu_ts,
                    end_gpu_ts,
                })
                .collect(),
        }],
        ..Default::default()
    }
}

pub fn job(ioctl_ts: u64, hw_start_ts: u64) -> GpuJob {
    GpuJob {
        thread_id: THREAD_ID,
        amdgpu_cs_ioctl_ts: ioctl_ts,
        gpu_hw_start_ts: hw_start_ts,
        timeline_handle: TIMELINE_HANDLE,
        depth: 0,
    }
}

/// A marker begun in `origin` and ended in the submission carrying it.
pub fn marker(origin: &CpuSubmission, begin_gpu_ts: u64, end_gpu_ts: u64) -> DebugMarker {
    DebugMarker {
        begin: Some(MarkerOrigin {
            thread_id: origin.thread_id,
            pre_submission_cpu_ts: origin.pre_submission_cpu_ts,
            post_submission_cpu_ts: origin.post_submission_cpu_ts,
            gpu_ts: begin_gpu_ts,
        }),
        end_gpu_ts,
        depth: 0,
        text_handle: MARKER_TEXT_HANDLE,
        color: Some(MarkerColor {
            red: 1.0,
            green: 0.0,
            blue: 0.5,
            alpha: 1.0,
        }),
    }
}

pub fn string(handle: u64, value: &str) -> CaptureEvent {
    CaptureEvent::String {
        handle,
        value: value.to_string(),
    }
}

/// Write `events` as a JSON-lines capture. The directory must outlive the path.
pub fn write_capture(events: &[CaptureEvent]) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("capture.jsonl");
    let mut file = std::fs::File::create(&path).expect("Failed to create capture");
    for event in events {
        serde_json::to_writer(&mut file, event).expect("Failed to serialize event");
        file.write_all(b"\n").expect("Failed to write capture");
    }
    (dir, path)
}

/// A sample whose stack copy starts at `rsp` and holds `stack`.
pub fn sample(rip: u64, rsp: u64, rbp: u64, ips: &[u64], stack: Vec<u8>) -> CallchainSample {
    CallchainSample {
        process_id: PROCESS_ID,
        thread_id: THREAD_ID,
        registers: Registers {
            rip,
            rsp,
            rbp,
            ..Default::default()
        },
        ips: ips.to_vec(),
        stack_slice: StackSlice {
            start_address: rsp,
            data: stack,
        },
    }
}

/// Unwinder for code built without frame pointers where every function in
/// `leaf_functions` keeps its return address at `[rsp]`.
pub struct ReturnAddressUnwinder {
    pub leaf_functions: Vec<(u64, u64)>,
    pub frame_pointer_functions: Vec<(u64, u64)>,
}

impl ReturnAddressUnwinder {
    fn contains(ranges: &[(u64, u64)], rip: u64) -> bool {
        ranges.iter().any(|&(start, end)| start <= rip && rip < end)
    }
}

impl Unwinder for ReturnAddressUnwinder {
    fn has_frame_pointer_at(
        &mut self,
        rip: u64,
        _pid: i32,
        _maps: &dyn MemoryMaps,
    ) -> Option<bool> {
        if Self::contains(&self.frame_pointer_functions, rip) {
            Some(true)
        } else if Self::contains(&self.leaf_functions, rip) {
            Some(false)
        } else {
            None
        }
    }

    fn unwind(
        &mut self,
        _pid: i32,
        _maps: &dyn MemoryMaps,
        registers: &Registers,
        stack_slices: &[StackSliceView<'_>],
        max_frames: usize,
    ) -> UnwindResult {
        assert_eq!(max_frames, 1);
        let memory = MultiSliceMemory::new(stack_slices);
        let Some(return_address) = memory.read_u64(registers.rsp) else {
            return UnwindResult {
                frames: Vec::new(),
                registers: *registers,
                success: false,
            };
        };
        UnwindResult {
            frames: vec![registers.rip],
            registers: Registers {
                rip: return_address,
                rsp: registers.rsp + 8,
                ..*registers
            },
            success: false,
        }
    }
}
