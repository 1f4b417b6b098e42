//! Restores the caller of a leaf function in frame-pointer callchains.
//!
//! The kernel walks `rbp` to build user callchains. A leaf function compiled
//! without frame pointers never pushes `rbp`, so the kernel's walk starts at
//! the caller's frame record and reports the caller's caller as `ips[1]`: the
//! actual caller is missing. As long as the leaf did not clobber `rbp`, a
//! single DWARF unwind step over the copied top of the stack recovers the
//! missing return address, which is then spliced into the callchain.

use tracing::debug;

use crate::callstack::{CallchainSample, CallstackStatus};
use crate::maps::MemoryMaps;
use crate::memory::StackSliceView;
use crate::unwind::Unwinder;

/// Largest user stack perf_event_open copies per sample.
pub const DEFAULT_STACK_DUMP_SIZE: u64 = 65000;

/// Bytes above the frame pointer holding the saved `rbp` and the return address.
const FRAME_RECORD_SIZE: u64 = 16;

#[derive(Debug, Clone)]
pub struct LeafPatchConfig {
    /// Maximum number of stack bytes copied per sample.
    pub stack_dump_size: u64,
}

impl Default for LeafPatchConfig {
    fn default() -> Self {
        Self {
            stack_dump_size: DEFAULT_STACK_DUMP_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeafFrameSynthesizer {
    stack_dump_size: u64,
}

impl LeafFrameSynthesizer {
    pub fn new(config: LeafPatchConfig) -> Self {
        Self {
            stack_dump_size: config.stack_dump_size,
        }
    }

    pub fn stack_dump_size(&self) -> u64 {
        self.stack_dump_size
    }

    /// Insert the caller of the sampled function at `ips[2]` if the sampled
    /// function had not set up its frame pointer.
    ///
    /// `sample.ips` is only modified when `Complete` is returned.
    ///
    /// # Panics
    ///
    /// If `sample.ips` has fewer than two entries.
    pub fn patch_leaf_caller(
        &self,
        sample: &mut CallchainSample,
        maps: &dyn MemoryMaps,
        unwinder: &mut dyn Unwinder,
    ) -> CallstackStatus {
        assert!(
            sample.ips.len() >= 2,
            "callchain needs the sampled ip and at least one caller, got {}",
            sample.ips.len()
        );

        let regs = sample.registers;
        let (rip, rsp, rbp) = (regs.rip, regs.rsp, regs.rbp);

        // The stack grows down, so a frame pointer below the stack pointer
        // means rbp is used as a general purpose register.
        if rbp < rsp {
            return CallstackStatus::FramePointerUnwindingError;
        }

        match unwinder.has_frame_pointer_at(rip, sample.process_id, maps) {
            None => {
                debug!("No CFI found for {rip:#x}");
                return CallstackStatus::StackTopDwarfUnwindingError;
            }
            Some(true) => return CallstackStatus::Complete,
            Some(false) => {}
        }

        let needed_stack_bytes = (rbp - rsp).saturating_add(FRAME_RECORD_SIZE);
        let too_small = needed_stack_bytes > self.stack_dump_size;
        let unwind_error = if too_small {
            CallstackStatus::StackTopForDwarfUnwindingTooSmall
        } else {
            CallstackStatus::StackTopDwarfUnwindingError
        };

        let stack = &sample.stack_slice;
        // A copy starting above rsp holds nothing of the frame.
        let available = rsp
            .checked_sub(stack.start_address)
            .and_then(|offset| stack.data.get(offset as usize..))
            .unwrap_or(&[]);
        let view_size = needed_stack_bytes
            .min(self.stack_dump_size)
            .min(available.len() as u64) as usize;
        let stack_slices = [StackSliceView::new(rsp, &available[..view_size])];

        let result = unwinder.unwind(sample.process_id, maps, &regs, &stack_slices, 1);

        // Reaching the top of the stack means the sampled function is the
        // outermost frame: there is no caller to restore.
        if result.success {
            return CallstackStatus::Complete;
        }

        let unwound = result.registers;
        if result.frames.is_empty() || (unwound.rip == rip && unwound.rsp == rsp) {
            debug!(
                "Unwinding the top of the stack of thread {} failed: {}",
                sample.thread_id, unwind_error
            );
            return unwind_error;
        }

        if unwound.rbp != rbp {
            if unwound.rbp < rbp {
                return CallstackStatus::FramePointerUnwindingError;
            }
            // The unwinder restored a different, plausible frame pointer, so
            // the sampled function maintains one and the callchain is right.
            return CallstackStatus::Complete;
        }

        let caller = unwound.rip;
        if !maps.find(caller).is_some_and(|map| map.is_executable()) {
            debug!("Unwound caller {caller:#x} is not in executable memory");
            return unwind_error;
        }

        // Already restored by an earlier pass over this sample.
        if sample.ips.get(2) == Some(&caller) {
            return CallstackStatus::Complete;
        }

        sample.ips.insert(2, caller);
        CallstackStatus::Complete
    }
}
