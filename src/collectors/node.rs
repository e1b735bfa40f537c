//! Kernel statistics collector.
//!
//! Reads CPU times, memory, network and disk counters from procfs plus
//! filesystem sizes from statvfs. All readers run before any delta state is
//! touched, so a failing reader leaves the previous baselines intact.

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, instrument};

use super::diskstats::{read_diskstats, DiskStats};
use super::filesystem::{read_filesystem_stats, FilesystemStats};
use super::netdev::{read_netdev_stats, NetDevStats};
use super::{collect_all, describe_all, SourceCollector};
use crate::delta::DeltaTracker;
use crate::error::{CollectorError, Error};
use crate::system::{read_cpu_times, read_memory_info, CpuTimes, MemoryInfo, CLK_TCK};

const NAME: &str = "node";

/// Options for the kernel statistics collector.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// procfs mount point.
    pub proc_root: PathBuf,
    /// Required services; usually empty so the collector always runs.
    pub services: Vec<String>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            services: Vec::new(),
        }
    }
}

#[derive(Default)]
struct NodeState {
    cpu: DeltaTracker<(), CpuTimes>,
    net: DeltaTracker<String, NetDevStats>,
    disk: DeltaTracker<String, DiskStats>,
}

/// Collector for host CPU, memory, network and disk metrics.
pub struct Node {
    opts: NodeOptions,
    state: Mutex<NodeState>,

    cpu: CounterVec,
    mem: GaugeVec,
    swap: GaugeVec,
    net: CounterVec,
    disk: GaugeVec,
    diskio: CounterVec,
}

impl Node {
    /// Creates the collector and checks that every procfs source is readable.
    pub fn new(opts: NodeOptions) -> Result<Self, Error> {
        let node = Self {
            cpu: CounterVec::new(
                Opts::new("node_cpu_seconds_total", "Total CPU time in seconds."),
                &["mode"],
            )?,
            mem: GaugeVec::new(
                Opts::new("node_mem_bytes", "Memory size in bytes."),
                &["type"],
            )?,
            swap: GaugeVec::new(Opts::new("node_swap_bytes", "Swap size in bytes."), &["type"])?,
            net: CounterVec::new(
                Opts::new("node_net_bytes_total", "Network traffic in bytes."),
                &["interface", "type"],
            )?,
            disk: GaugeVec::new(
                Opts::new("node_disk_kilobytes", "Hard disk size in kilobytes."),
                &["device", "type"],
            )?,
            diskio: CounterVec::new(
                Opts::new("node_diskio_seconds_total", "Hard disk time in seconds."),
                &["device", "type"],
            )?,
            state: Mutex::new(NodeState::default()),
            opts,
        };

        node.read().map_err(Error::from)?;
        debug!("Node collector reading from {}", node.opts.proc_root.display());
        Ok(node)
    }

    fn read(&self) -> Result<NodeReading, CollectorError> {
        let root = &self.opts.proc_root;
        let fetch = |e: String| CollectorError::fetch(NAME, e);
        Ok(NodeReading {
            cpu: read_cpu_times(root).map_err(fetch)?,
            mem: read_memory_info(root).map_err(fetch)?,
            net: read_netdev_stats(root).map_err(fetch)?,
            disk: read_filesystem_stats(root).map_err(fetch)?,
            diskio: read_diskstats(root).map_err(fetch)?,
        })
    }

    fn publish(&self, reading: NodeReading) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ticks = *CLK_TCK;

        let cpu = state.cpu.update((), reading.cpu);
        let secs = |t: u64| t as f64 / ticks;
        self.cpu.with_label_values(&["system"]).inc_by(secs(cpu.system));
        self.cpu
            .with_label_values(&["user"])
            .inc_by(secs(cpu.user.wrapping_add(cpu.nice)));
        self.cpu.with_label_values(&["iowait"]).inc_by(secs(cpu.iowait));
        self.cpu.with_label_values(&["idle"]).inc_by(secs(cpu.idle));
        self.cpu.with_label_values(&["rest"]).inc_by(secs(cpu.rest()));

        let mem = reading.mem;
        self.mem.reset();
        self.mem.with_label_values(&["total"]).set(mem.total_bytes as f64);
        self.mem
            .with_label_values(&["used"])
            .set(mem.total_bytes.saturating_sub(mem.available_bytes) as f64);
        self.mem.with_label_values(&["free"]).set(mem.free_bytes as f64);
        self.mem.with_label_values(&["shared"]).set(mem.shared_bytes as f64);
        self.mem.with_label_values(&["buffers"]).set(mem.buffers_bytes as f64);
        self.mem
            .with_label_values(&["cache"])
            .set((mem.cached_bytes + mem.reclaimable_bytes) as f64);
        self.mem
            .with_label_values(&["available"])
            .set(mem.available_bytes as f64);

        self.swap.reset();
        self.swap
            .with_label_values(&["total"])
            .set(mem.swap_total_bytes as f64);
        self.swap
            .with_label_values(&["used"])
            .set(mem.swap_total_bytes.saturating_sub(mem.swap_free_bytes) as f64);

        let mut vanished = Vec::new();
        state.net.retain(|k| {
            let keep = reading.net.contains_key(k);
            if !keep {
                vanished.push(k.clone());
            }
            keep
        });
        for interface in vanished {
            debug!("Interface {} vanished", interface);
            for kind in ["rx", "tx"] {
                let _ = self.net.remove_label_values(&[interface.as_str(), kind]);
            }
        }
        for (interface, stat) in reading.net {
            if interface == "lo" {
                continue;
            }
            let delta = state.net.update(interface.clone(), stat);
            self.net
                .with_label_values(&[interface.as_str(), "rx"])
                .inc_by(delta.receive_bytes as f64);
            self.net
                .with_label_values(&[interface.as_str(), "tx"])
                .inc_by(delta.transmit_bytes as f64);
        }

        self.disk.reset();
        for (device, stat) in &reading.disk {
            let device = device.as_str();
            self.disk.with_label_values(&[device, "total"]).set(stat.total_kb as f64);
            self.disk.with_label_values(&[device, "used"]).set(stat.used_kb() as f64);
            self.disk.with_label_values(&[device, "free"]).set(stat.free_kb as f64);
            self.disk
                .with_label_values(&[device, "available"])
                .set(stat.available_kb as f64);
        }

        let mut vanished = Vec::new();
        state.disk.retain(|k| {
            let keep = reading.diskio.contains_key(k);
            if !keep {
                vanished.push(k.clone());
            }
            keep
        });
        for device in vanished {
            debug!("Block device {} vanished", device);
            for kind in ["total", "read", "write"] {
                let _ = self.diskio.remove_label_values(&[device.as_str(), kind]);
            }
        }
        for (device, stat) in reading.diskio {
            let delta = state.disk.update(device.clone(), stat);
            let device = device.as_str();
            self.diskio
                .with_label_values(&[device, "total"])
                .inc_by(delta.time_io_ms as f64 / 1000.0);
            self.diskio
                .with_label_values(&[device, "read"])
                .inc_by(delta.time_reading_ms as f64 / 1000.0);
            self.diskio
                .with_label_values(&[device, "write"])
                .inc_by(delta.time_writing_ms as f64 / 1000.0);
        }
    }
}

struct NodeReading {
    cpu: CpuTimes,
    mem: MemoryInfo,
    net: HashMap<String, NetDevStats>,
    disk: HashMap<String, FilesystemStats>,
    diskio: HashMap<String, DiskStats>,
}

#[async_trait]
impl SourceCollector for Node {
    fn name(&self) -> &str {
        NAME
    }

    fn describe(&self) -> Vec<&Desc> {
        describe_all(&[
            &self.cpu,
            &self.mem,
            &self.swap,
            &self.net,
            &self.disk,
            &self.diskio,
        ])
    }

    #[instrument(skip(self), fields(collector = NAME))]
    async fn collect(&self) -> Result<Vec<MetricFamily>, CollectorError> {
        let start = Instant::now();
        let reading = self.read()?;
        self.publish(reading);
        debug!("collect duration for node: {:?}", start.elapsed());

        Ok(collect_all(&[
            &self.cpu,
            &self.mem,
            &self.swap,
            &self.net,
            &self.disk,
            &self.diskio,
        ]))
    }

    fn required_services(&self) -> &[String] {
        &self.opts.services
    }
}
