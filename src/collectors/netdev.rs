//! Network interface statistics.
//!
//! This module reads byte counters per interface from /proc/net/dev.

use ahash::AHashMap as HashMap;
use std::fs;
use std::path::Path;

use crate::delta::Counters;

/// Cumulative byte counters of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetDevStats {
    pub receive_bytes: u64,
    pub transmit_bytes: u64,
}

impl Counters for NetDevStats {
    fn wrapping_delta(&self, previous: &Self) -> Self {
        Self {
            receive_bytes: self.receive_bytes.wrapping_sub(previous.receive_bytes),
            transmit_bytes: self.transmit_bytes.wrapping_sub(previous.transmit_bytes),
        }
    }
}

/// Parses /proc/net/dev content into interface name → counters.
pub fn parse_netdev_stats(content: &str) -> Result<HashMap<String, NetDevStats>, String> {
    let mut stats = HashMap::new();

    for (idx, line) in content.lines().enumerate() {
        // Skip the first two header lines
        if idx < 2 {
            continue;
        }

        let Some((interface, values)) = line.split_once(':') else {
            continue;
        };

        let values: Vec<&str> = values.split_whitespace().collect();
        if values.len() < 16 {
            return Err(format!(
                "Malformed /proc/net/dev line for {}: expected 16 fields, got {}",
                interface.trim(),
                values.len()
            ));
        }

        let parse = |i: usize| {
            values[i]
                .parse::<u64>()
                .map_err(|e| format!("Invalid counter '{}' in /proc/net/dev: {}", values[i], e))
        };

        stats.insert(
            interface.trim().to_string(),
            NetDevStats {
                receive_bytes: parse(0)?,
                transmit_bytes: parse(8)?,
            },
        );
    }

    Ok(stats)
}

/// Reads network interface statistics from `<proc>/net/dev`.
pub fn read_netdev_stats(proc_root: &Path) -> Result<HashMap<String, NetDevStats>, String> {
    let path = proc_root.join("net/dev");
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse_netdev_stats(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9876543    5000    1    2    0     0          0        10  1234567    4000    3    4    0     0       0          0
";

    #[test]
    fn test_parse_netdev_stats() {
        let stats = parse_netdev_stats(NET_DEV).unwrap();
        assert_eq!(stats.len(), 2);
        let eth0 = stats.get("eth0").unwrap();
        assert_eq!(eth0.receive_bytes, 9876543);
        assert_eq!(eth0.transmit_bytes, 1234567);
    }

    #[test]
    fn test_parse_netdev_malformed_line() {
        let content = "h1\nh2\n eth0: 1 2 3\n";
        assert!(parse_netdev_stats(content).is_err());
    }
}
