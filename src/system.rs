//! System-wide readings from the /proc filesystem.
//!
//! This module provides readers for aggregate CPU times (`/proc/stat`) and
//! memory/swap sizes (`/proc/meminfo`). Each reader takes the procfs root so
//! tests can point it at fixture files.

use once_cell::sync::Lazy;
use std::fs;
use std::path::Path;

use crate::delta::Counters;

/// Get system clock ticks per second (usually 100, but can vary).
fn get_clk_tck() -> f64 {
    // SAFETY: sysconf is safe to call with _SC_CLK_TCK
    // Returns -1 on error, 0 if undefined - both are handled by the > 0 check
    unsafe {
        let tck = libc::sysconf(libc::_SC_CLK_TCK);
        if tck > 0 {
            return tck as f64;
        }
    }
    100.0
}

/// System clock ticks per second (for CPU time calculation).
pub static CLK_TCK: Lazy<f64> = Lazy::new(get_clk_tck);

/// Aggregate CPU times in clock ticks, from the `cpu` line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

impl CpuTimes {
    /// Time not accounted as user, system, iowait or idle.
    pub fn rest(&self) -> u64 {
        self.irq
            .wrapping_add(self.softirq)
            .wrapping_add(self.steal)
            .wrapping_add(self.guest)
            .wrapping_add(self.guest_nice)
    }
}

impl Counters for CpuTimes {
    // this is fine when a u64 counter wraps around to zero
    fn wrapping_delta(&self, previous: &Self) -> Self {
        Self {
            user: self.user.wrapping_sub(previous.user),
            nice: self.nice.wrapping_sub(previous.nice),
            system: self.system.wrapping_sub(previous.system),
            idle: self.idle.wrapping_sub(previous.idle),
            iowait: self.iowait.wrapping_sub(previous.iowait),
            irq: self.irq.wrapping_sub(previous.irq),
            softirq: self.softirq.wrapping_sub(previous.softirq),
            steal: self.steal.wrapping_sub(previous.steal),
            guest: self.guest.wrapping_sub(previous.guest),
            guest_nice: self.guest_nice.wrapping_sub(previous.guest_nice),
        }
    }
}

/// Memory and swap sizes in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
    pub shared_bytes: u64,
    pub buffers_bytes: u64,
    pub cached_bytes: u64,
    pub reclaimable_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

/// Parses the aggregate `cpu` line of /proc/stat.
pub fn parse_cpu_times(content: &str) -> Result<CpuTimes, String> {
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| "No aggregate cpu line found in /proc/stat".to_string())?;

    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to parse cpu line: {}", e))?;
    if values.len() < 4 {
        return Err(format!(
            "Invalid cpu line: expected at least 4 fields, got {}",
            values.len()
        ));
    }

    let field = |i: usize| values.get(i).copied().unwrap_or(0);
    Ok(CpuTimes {
        user: field(0),
        nice: field(1),
        system: field(2),
        idle: field(3),
        iowait: field(4),
        irq: field(5),
        softirq: field(6),
        steal: field(7),
        guest: field(8),
        guest_nice: field(9),
    })
}

/// Reads aggregate CPU times from `<proc>/stat`.
pub fn read_cpu_times(proc_root: &Path) -> Result<CpuTimes, String> {
    let path = proc_root.join("stat");
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse_cpu_times(&content)
}

/// Parses /proc/meminfo. MemTotal and MemAvailable are required.
pub fn parse_memory_info(content: &str) -> Result<MemoryInfo, String> {
    let mut info = MemoryInfo::default();
    let mut have_total = false;
    let mut have_available = false;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        let bytes = kb * 1024;

        match key {
            "MemTotal:" => {
                info.total_bytes = bytes;
                have_total = true;
            }
            "MemFree:" => info.free_bytes = bytes,
            "MemAvailable:" => {
                info.available_bytes = bytes;
                have_available = true;
            }
            "Shmem:" => info.shared_bytes = bytes,
            "Buffers:" => info.buffers_bytes = bytes,
            "Cached:" => info.cached_bytes = bytes,
            "SReclaimable:" => info.reclaimable_bytes = bytes,
            "SwapTotal:" => info.swap_total_bytes = bytes,
            "SwapFree:" => info.swap_free_bytes = bytes,
            _ => {}
        }
    }

    if !(have_total && have_available) {
        return Err("Failed to parse required fields from /proc/meminfo".to_string());
    }
    Ok(info)
}

/// Reads memory information from `<proc>/meminfo`.
pub fn read_memory_info(proc_root: &Path) -> Result<MemoryInfo, String> {
    let path = proc_root.join("meminfo");
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse_memory_info(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  4705 150 1120 16250 520 20 30 5 0 0\n\
                        cpu0 2352 75 560 8125 260 10 15 2 0 0\n\
                        intr 123\nctxt 456\nbtime 1700000000\n";

    const MEMINFO: &str = "MemTotal:       16000000 kB\n\
                           MemFree:         2000000 kB\n\
                           MemAvailable:    8000000 kB\n\
                           Buffers:          100000 kB\n\
                           Cached:          3000000 kB\n\
                           SwapTotal:       1000000 kB\n\
                           SwapFree:         900000 kB\n\
                           Shmem:             50000 kB\n\
                           SReclaimable:     200000 kB\n";

    #[test]
    fn test_parse_cpu_times() {
        let cpu = parse_cpu_times(STAT).unwrap();
        assert_eq!(cpu.user, 4705);
        assert_eq!(cpu.nice, 150);
        assert_eq!(cpu.idle, 16250);
        assert_eq!(cpu.rest(), 20 + 30 + 5);
    }

    #[test]
    fn test_parse_cpu_times_short_line() {
        let cpu = parse_cpu_times("cpu  1 2 3 4\n").unwrap();
        assert_eq!(cpu.iowait, 0);
        assert!(parse_cpu_times("cpu  1 2\n").is_err());
        assert!(parse_cpu_times("intr 1\n").is_err());
    }

    #[test]
    fn test_cpu_delta_wraps() {
        let prev = CpuTimes {
            user: u64::MAX,
            ..Default::default()
        };
        let cur = CpuTimes {
            user: 9,
            ..Default::default()
        };
        assert_eq!(cur.wrapping_delta(&prev).user, 10);
    }

    #[test]
    fn test_parse_memory_info() {
        let mem = parse_memory_info(MEMINFO).unwrap();
        assert_eq!(mem.total_bytes, 16_000_000 * 1024);
        assert_eq!(mem.available_bytes, 8_000_000 * 1024);
        assert_eq!(mem.reclaimable_bytes, 200_000 * 1024);
        assert_eq!(mem.swap_free_bytes, 900_000 * 1024);
    }

    #[test]
    fn test_parse_memory_info_missing_fields() {
        assert!(parse_memory_info("MemFree: 1 kB\n").is_err());
    }

    #[test]
    fn test_read_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), STAT).unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        assert_eq!(read_cpu_times(dir.path()).unwrap().system, 1120);
        assert_eq!(read_memory_info(dir.path()).unwrap().cached_bytes, 3_000_000 * 1024);
        assert!(read_cpu_times(&dir.path().join("missing")).is_err());
    }
}
