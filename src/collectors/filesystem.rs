//! Filesystem sizes for block-device mounts.
//!
//! This module lists /dev-backed mounts from /proc/mounts and asks statvfs
//! for their sizes.

use ahash::AHashMap as HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Sizes of one mounted filesystem, in kilobytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilesystemStats {
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
}

impl FilesystemStats {
    pub fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }
}

/// A `/dev/...` mount: device name without the `/dev/` prefix and its mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub device: String,
    pub mount_point: String,
}

/// Decodes the octal escapes /proc/mounts uses for spaces and tabs.
fn unescape_mount_point(raw: &str) -> String {
    raw.replace("\\040", " ").replace("\\011", "\t")
}

/// Parses /proc/mounts, keeping only block devices.
pub fn parse_mounts(content: &str) -> Result<Vec<Mount>, String> {
    let mut mounts = Vec::new();

    for (n, line) in content.lines().enumerate() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() < 4 {
            return Err(format!("/proc/mounts:{}: bad mount point", n));
        }
        let Some(device) = parts[0].strip_prefix("/dev/") else {
            continue;
        };

        mounts.push(Mount {
            device: device.to_string(),
            mount_point: unescape_mount_point(parts[1]),
        });
    }

    Ok(mounts)
}

/// Reads sizes of every block-device mount listed in `<proc>/mounts`.
///
/// A device mounted several times is reported once, from its first mount.
/// Mounts statvfs cannot query are left out.
pub fn read_filesystem_stats(proc_root: &Path) -> Result<HashMap<String, FilesystemStats>, String> {
    let path = proc_root.join("mounts");
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut stats = HashMap::new();
    for mount in parse_mounts(&content)? {
        if stats.contains_key(&mount.device) {
            continue;
        }
        match get_statvfs_stats(&mount.mount_point) {
            Ok(fs_stats) => {
                stats.insert(mount.device, fs_stats);
            }
            Err(e) => warn!("Skipping {}: {}", mount.device, e),
        }
    }
    Ok(stats)
}

/// Gets filesystem sizes using libc statvfs.
fn get_statvfs_stats(path: &str) -> Result<FilesystemStats, String> {
    use std::ffi::CString;
    use std::mem;

    let c_path = CString::new(path).map_err(|e| format!("Invalid path: {}", e))?;

    unsafe {
        // SAFETY: statvfs only writes into the zeroed struct we own
        let mut stat: libc::statvfs = mem::zeroed();
        let result = libc::statvfs(c_path.as_ptr(), &mut stat);

        if result != 0 {
            return Err(format!(
                "statvfs failed for {}: {}",
                path,
                std::io::Error::last_os_error()
            ));
        }

        let block_size = stat.f_frsize as u64;
        Ok(FilesystemStats {
            total_kb: block_size * stat.f_blocks as u64 / 1024,
            free_kb: block_size * stat.f_bfree as u64 / 1024,
            available_kb: block_size * stat.f_bavail as u64 / 1024,
        })
    }
}
