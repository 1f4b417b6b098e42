//! Memory views handed to the unwinder.
//!
//! Unwinding a sample reads from stack copies taken at sample time and,
//! optionally, from the live process. A read is never stitched together from
//! both sources.

use std::io::IoSliceMut;

use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use tracing::trace;

/// A borrowed copy of process memory starting at `start_address`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackSliceView<'a> {
    start_address: u64,
    data: &'a [u8],
}

impl<'a> StackSliceView<'a> {
    pub fn new(start_address: u64, data: &'a [u8]) -> Self {
        Self {
            start_address,
            data,
        }
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    pub fn end_address(&self) -> u64 {
        self.start_address.saturating_add(self.size())
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Source of process memory. Returns the number of bytes copied into `dst`.
pub trait ProcessMemory {
    fn read(&self, address: u64, dst: &mut [u8]) -> usize;

    fn read_u64(&self, address: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        (self.read(address, &mut buf) == buf.len()).then(|| u64::from_le_bytes(buf))
    }
}

/// Stack slices composed with an optional fallback to live process memory.
///
/// Several slices are supported so that callstacks switching between two
/// stacks (e.g. Wine's Windows and Unix stacks) can be unwound offline.
pub struct MultiSliceMemory<'a> {
    slices: Vec<StackSliceView<'a>>,
    process_memory: Option<&'a dyn ProcessMemory>,
}

impl<'a> MultiSliceMemory<'a> {
    pub fn new(slices: &[StackSliceView<'a>]) -> Self {
        Self {
            slices: slices.to_vec(),
            process_memory: None,
        }
    }

    pub fn with_process_memory(
        slices: &[StackSliceView<'a>],
        process_memory: &'a dyn ProcessMemory,
    ) -> Self {
        Self {
            slices: slices.to_vec(),
            process_memory: Some(process_memory),
        }
    }
}

impl ProcessMemory for MultiSliceMemory<'_> {
    fn read(&self, address: u64, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let Some(end) = address.checked_add(dst.len() as u64) else {
            return 0;
        };

        for slice in &self.slices {
            if slice.start_address() <= address && end <= slice.end_address() {
                let offset = (address - slice.start_address()) as usize;
                dst.copy_from_slice(&slice.data()[offset..offset + dst.len()]);
                return dst.len();
            }
        }

        // Mixing offline and online bytes within one read would hand out
        // memory from two different points in time.
        if self
            .slices
            .iter()
            .any(|slice| address < slice.end_address() && slice.start_address() < end)
        {
            trace!(
                "Read of {} bytes at {:#x} partially overlaps a stack slice",
                dst.len(),
                address
            );
            return 0;
        }

        match self.process_memory {
            Some(process_memory) => process_memory.read(address, dst),
            None => 0,
        }
    }
}

/// Reads the memory of a running process with `process_vm_readv`.
#[derive(Clone, Copy, Debug)]
pub struct LiveProcessMemory {
    pid: Pid,
}

impl LiveProcessMemory {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }
}

impl ProcessMemory for LiveProcessMemory {
    fn read(&self, address: u64, dst: &mut [u8]) -> usize {
        let len = dst.len();
        let remote = [RemoteIoVec {
            base: address as usize,
            len,
        }];
        match process_vm_readv(self.pid, &mut [IoSliceMut::new(dst)], &remote) {
            Ok(read) => read,
            Err(e) => {
                trace!("process_vm_readv of {len} bytes at {address:#x} failed: {e}");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FilledMemory(u8);

    impl ProcessMemory for FilledMemory {
        fn read(&self, _address: u64, dst: &mut [u8]) -> usize {
            dst.fill(self.0);
            dst.len()
        }
    }

    fn bytes(start: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| start.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_read_inside_slice() {
        let data = bytes(0, 32);
        let memory = MultiSliceMemory::new(&[StackSliceView::new(0x1000, &data)]);

        let mut dst = [0u8; 4];
        assert_eq!(memory.read(0x1004, &mut dst), 4);
        assert_eq!(dst, [4, 5, 6, 7]);

        let mut dst = [0u8; 32];
        assert_eq!(memory.read(0x1000, &mut dst), 32);
    }

    #[test]
    fn test_read_from_second_slice() {
        let first = bytes(0, 16);
        let second = bytes(100, 16);
        let memory = MultiSliceMemory::new(&[
            StackSliceView::new(0x1000, &first),
            StackSliceView::new(0x8000, &second),
        ]);

        let mut dst = [0u8; 2];
        assert_eq!(memory.read(0x8002, &mut dst), 2);
        assert_eq!(dst, [102, 103]);
    }

    #[test]
    fn test_partial_overlap_reads_nothing() {
        let data = bytes(0, 16);
        let fallback = FilledMemory(0xAA);
        let memory =
            MultiSliceMemory::with_process_memory(&[StackSliceView::new(0x1000, &data)], &fallback);

        let mut dst = [0u8; 8];
        assert_eq!(memory.read(0x100C, &mut dst), 0);
        assert_eq!(memory.read(0x0FFC, &mut dst), 0);
        assert_eq!(dst, [0u8; 8]);
    }

    #[test]
    fn test_outside_slices_uses_process_memory() {
        let data = bytes(0, 16);
        let fallback = FilledMemory(0xAA);
        let memory =
            MultiSliceMemory::with_process_memory(&[StackSliceView::new(0x1000, &data)], &fallback);

        let mut dst = [0u8; 4];
        assert_eq!(memory.read(0x2000, &mut dst), 4);
        assert_eq!(dst, [0xAA; 4]);

        // Adjacent to the slice, but not overlapping it.
        assert_eq!(memory.read(0x1010, &mut dst), 4);
    }

    #[test]
    fn test_outside_slices_without_process_memory() {
        let data = bytes(0, 16);
        let memory = MultiSliceMemory::new(&[StackSliceView::new(0x1000, &data)]);
        let mut dst = [0u8; 4];
        assert_eq!(memory.read(0x2000, &mut dst), 0);
    }

    #[test]
    fn test_read_u64_little_endian() {
        let data = 0xC000u64.to_le_bytes();
        let memory = MultiSliceMemory::new(&[StackSliceView::new(0x7FFF0000, &data)]);
        assert_eq!(memory.read_u64(0x7FFF0000), Some(0xC000));
        assert_eq!(memory.read_u64(0x7FFF0004), None);
    }

    #[test]
    fn test_address_overflow() {
        let memory = MultiSliceMemory::new(&[]);
        let mut dst = [0u8; 8];
        assert_eq!(memory.read(u64::MAX - 2, &mut dst), 0);
    }
}
