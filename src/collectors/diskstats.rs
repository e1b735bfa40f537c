//! Disk I/O statistics.
//!
//! This module reads per-device I/O time counters from /proc/diskstats.

use ahash::AHashMap as HashMap;
use std::fs;
use std::path::Path;

use crate::delta::Counters;

/// Cumulative I/O times of one block device, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub time_reading_ms: u64,
    pub time_writing_ms: u64,
    pub time_io_ms: u64,
}

impl Counters for DiskStats {
    fn wrapping_delta(&self, previous: &Self) -> Self {
        Self {
            time_reading_ms: self.time_reading_ms.wrapping_sub(previous.time_reading_ms),
            time_writing_ms: self.time_writing_ms.wrapping_sub(previous.time_writing_ms),
            time_io_ms: self.time_io_ms.wrapping_sub(previous.time_io_ms),
        }
    }
}

/// Parses /proc/diskstats content into device name → counters.
///
/// Format: major minor name read_ios read_merges read_sectors read_ticks write_ios write_merges write_sectors write_ticks ios_in_progress io_ticks weighted_io_ticks ...
pub fn parse_diskstats(content: &str) -> Result<HashMap<String, DiskStats>, String> {
    let mut stats = HashMap::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() < 14 {
            return Err(format!(
                "Malformed /proc/diskstats line: expected at least 14 fields, got {}",
                parts.len()
            ));
        }

        let device = parts[2];
        if device.starts_with("loop") || device.starts_with("ram") {
            continue;
        }

        let parse = |i: usize| {
            parts[i]
                .parse::<u64>()
                .map_err(|e| format!("Invalid counter '{}' for {}: {}", parts[i], device, e))
        };

        stats.insert(
            device.to_string(),
            DiskStats {
                time_reading_ms: parse(6)?,
                time_writing_ms: parse(10)?,
                time_io_ms: parse(12)?,
            },
        );
    }

    Ok(stats)
}

/// Reads disk statistics from `<proc>/diskstats`.
pub fn read_diskstats(proc_root: &Path) -> Result<HashMap<String, DiskStats>, String> {
    let path = proc_root.join("diskstats");
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse_diskstats(&content)
}
