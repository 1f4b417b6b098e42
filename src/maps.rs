//! Memory mappings of the sampled process.

use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

pub const PROT_READ: u32 = 0x1;
pub const PROT_WRITE: u32 = 0x2;
pub const PROT_EXEC: u32 = 0x4;

/// Matches one line of `/proc/<pid>/maps`:
/// `start-end perms offset dev inode [path]`.
static PROC_MAPS_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-fA-F]+)-([0-9a-fA-F]+)\s+([r-][w-][x-][ps])\s+([0-9a-fA-F]+)\s+\S+\s+\d+\s*(.*)$")
        .expect("Invalid proc maps regex pattern")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapInfo {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    /// Combination of `PROT_READ`, `PROT_WRITE` and `PROT_EXEC`.
    pub flags: u32,
    pub name: String,
}

impl MapInfo {
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PROT_EXEC != 0
    }
}

/// Lookup of the mapping containing an address.
pub trait MemoryMaps {
    fn find(&self, address: u64) -> Option<&MapInfo>;
}

/// Mappings kept sorted by start address.
#[derive(Clone, Debug, Default)]
pub struct ModuleMaps {
    maps: Vec<MapInfo>,
}

impl ModuleMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the contents of `/proc/<pid>/maps`.
    pub fn parse_proc_maps(contents: &str) -> Result<Self> {
        let mut maps = Self::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let Some(captures) = PROC_MAPS_LINE_RE.captures(line) else {
                bail!("Malformed maps line {}: {line}", index + 1);
            };
            let start = u64::from_str_radix(&captures[1], 16)
                .with_context(|| format!("Invalid start address on maps line {}", index + 1))?;
            let end = u64::from_str_radix(&captures[2], 16)
                .with_context(|| format!("Invalid end address on maps line {}", index + 1))?;
            let offset = u64::from_str_radix(&captures[4], 16)
                .with_context(|| format!("Invalid offset on maps line {}", index + 1))?;
            if end < start {
                bail!("Maps line {} ends before it starts: {line}", index + 1);
            }

            let perms = captures[3].as_bytes();
            let mut flags = 0;
            if perms[0] == b'r' {
                flags |= PROT_READ;
            }
            if perms[1] == b'w' {
                flags |= PROT_WRITE;
            }
            if perms[2] == b'x' {
                flags |= PROT_EXEC;
            }

            maps.add_and_sort(start, end, offset, flags, captures[5].trim());
        }
        Ok(maps)
    }

    /// Read and parse `/proc/<pid>/maps` of a live process.
    pub fn from_pid(pid: i32) -> Result<Self> {
        let path = format!("/proc/{pid}/maps");
        let contents =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {path}"))?;
        Self::parse_proc_maps(&contents)
    }

    pub fn add_and_sort(&mut self, start: u64, end: u64, offset: u64, flags: u32, name: &str) {
        let info = MapInfo {
            start,
            end,
            offset,
            flags,
            name: name.to_string(),
        };
        let index = self.maps.partition_point(|map| map.start < start);
        self.maps.insert(index, info);
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapInfo> {
        self.maps.iter()
    }
}

impl MemoryMaps for ModuleMaps {
    fn find(&self, address: u64) -> Option<&MapInfo> {
        let index = self.maps.partition_point(|map| map.start <= address);
        let candidate = self.maps.get(index.checked_sub(1)?)?;
        candidate.contains(address).then_some(candidate)
    }
}
