//! Contract of the DWARF unwinder used for leaf-function patching.

use crate::callstack::Registers;
use crate::maps::MemoryMaps;
use crate::memory::StackSliceView;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnwindResult {
    /// Program counters of the unwound frames, innermost first.
    pub frames: Vec<u64>,
    /// Register state of the outermost unwound frame.
    pub registers: Registers,
    /// The unwinder reached the top of the stack without error.
    pub success: bool,
}

pub trait Unwinder {
    /// Consult CFI to decide whether the function containing `rip` has already
    /// set up its frame pointer at that instruction. `None` if no CFI covers
    /// `rip`.
    fn has_frame_pointer_at(&mut self, rip: u64, pid: i32, maps: &dyn MemoryMaps)
        -> Option<bool>;

    /// Unwind at most `max_frames` frames, reading stack memory only from
    /// `stack_slices`.
    fn unwind(
        &mut self,
        pid: i32,
        maps: &dyn MemoryMaps,
        registers: &Registers,
        stack_slices: &[StackSliceView<'_>],
        max_frames: usize,
    ) -> UnwindResult;
}
