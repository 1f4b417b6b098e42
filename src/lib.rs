//! profjoin library - GPU submission correlation and leaf-function callchain
//! repair for CPU/GPU profiles.
//!
//! # Modules
//!
//! - [`correlator`] - Joins Vulkan queue submissions with `amdgpu_cs_ioctl` jobs
//!   and emits command buffer and debug marker slices on the CPU clock
//! - [`leaf`] - Restores the missing caller of frame-pointer-less leaf functions
//! - [`memory`] - Stack slice views and process memory sources for unwinding
//! - [`maps`] - Process memory mappings
//! - [`replay`] - JSON-lines capture replay
//!
//! # Example
//!
//! ```no_run
//! use profjoin::{replay_capture, CorrelatorConfig};
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! let file = File::open("capture.jsonl").expect("Failed to open capture");
//! let output = replay_capture(BufReader::new(file), CorrelatorConfig::default())
//!     .expect("Failed to replay capture");
//! println!("{} slices", output.slices.len());
//! ```

pub mod callstack;
pub mod correlator;
pub mod leaf;
pub mod maps;
pub mod memory;
pub mod replay;
pub mod strings;
pub mod types;
pub mod unwind;

pub use callstack::{CallchainSample, CallstackStatus, Registers, StackSlice};
pub use correlator::{
    extract_dxvk_group_id, CorrelatorConfig, PendingCounts, SubmissionCorrelator,
};
pub use leaf::{LeafFrameSynthesizer, LeafPatchConfig};
pub use maps::{MapInfo, MemoryMaps, ModuleMaps};
pub use memory::{LiveProcessMemory, MultiSliceMemory, ProcessMemory, StackSliceView};
pub use replay::{replay_capture, write_slices, CaptureEvent, ReplayOutput};
pub use strings::{InternedStrings, StringTable};
pub use types::{
    Color, CommandBuffer, CpuSubmission, DebugMarker, GpuJob, MarkerColor, MarkerOrigin,
    SliceType, SubmitInfo, TimerSlice, Timestamp,
};
pub use unwind::{UnwindResult, Unwinder};
