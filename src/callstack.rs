//! Callchain samples and their completeness status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How trustworthy a sampled callstack is after leaf-function patching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallstackStatus {
    Complete,
    FramePointerUnwindingError,
    StackTopDwarfUnwindingError,
    /// The copied stack was too small to unwind the innermost frame. Capturing
    /// with a larger stack dump may fix it.
    StackTopForDwarfUnwindingTooSmall,
}

impl CallstackStatus {
    pub fn is_complete(self) -> bool {
        self == CallstackStatus::Complete
    }
}

impl fmt::Display for CallstackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallstackStatus::Complete => write!(f, "complete"),
            CallstackStatus::FramePointerUnwindingError => {
                write!(f, "frame pointer unwinding error")
            }
            CallstackStatus::StackTopDwarfUnwindingError => {
                write!(f, "DWARF unwinding error at the top of the stack")
            }
            CallstackStatus::StackTopForDwarfUnwindingTooSmall => {
                write!(f, "stack dump too small for DWARF unwinding the top of the stack")
            }
        }
    }
}

/// x86_64 user registers as sampled by perf_event_open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

/// Process memory copied at sample time, starting at `start_address`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSlice {
    pub start_address: u64,
    pub data: Vec<u8>,
}

/// One hardware-sampled callchain.
///
/// `ips[0]` is the sampled instruction pointer and `ips[1]` the innermost
/// caller as found by the kernel through frame pointers. If the sampled
/// function is a leaf that never set up `rbp`, `ips[1]` is really the caller's
/// caller and the actual caller is missing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallchainSample {
    pub process_id: i32,
    pub thread_id: i32,
    pub registers: Registers,
    pub ips: Vec<u64>,
    pub stack_slice: StackSlice,
}
