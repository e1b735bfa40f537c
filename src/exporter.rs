//! Collection orchestrator.
//!
//! The [`Exporter`] owns every registered collector together with the service
//! bitmask it requires. A scrape resolves the active services once, runs all
//! eligible collectors concurrently and merges what they produced.

use ahash::AHashMap as HashMap;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use crate::collectors::SourceCollector;
use crate::error::{CollectorError, Error, GateError, ScrapeError};
use crate::gate::{is_eligible, ServiceGate, ServiceStatus};

/// Buffer capacity for text encoding.
const BUFFER_CAP: usize = 64 * 1024;

/// Append-only destination shared by the collector tasks of one scrape.
#[derive(Clone, Default)]
pub struct MetricSink {
    inner: Arc<Mutex<Vec<MetricFamily>>>,
}

impl MetricSink {
    pub fn append(&self, families: Vec<MetricFamily>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(families);
    }

    /// Takes everything appended so far.
    pub fn drain(&self) -> Vec<MetricFamily> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Result of one collection cycle.
#[derive(Debug, Default)]
pub struct Scrape {
    /// Merged families, sorted by name.
    pub families: Vec<MetricFamily>,
    pub errors: Vec<ScrapeError>,
    /// Collectors that ran, successfully or not.
    pub ran: Vec<String>,
    /// Collectors skipped because a required service was inactive.
    pub skipped: Vec<String>,
}

struct Registration {
    collector: Arc<dyn SourceCollector>,
    required: u64,
}

/// Fixed set of families handed to a throwaway registry for rendering.
struct Snapshot {
    descs: Vec<Desc>,
    families: Vec<MetricFamily>,
}

impl Collector for Snapshot {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.families.clone()
    }
}

pub struct Exporter {
    gate: ServiceGate,
    status: Arc<dyn ServiceStatus>,
    registrations: Vec<Registration>,
    service_active: GaugeVec,
    scrape_lock: tokio::sync::Mutex<()>,
}

impl Exporter {
    pub fn new(status: Arc<dyn ServiceStatus>) -> Result<Self, Error> {
        Ok(Self {
            gate: ServiceGate::new(),
            status,
            registrations: Vec::new(),
            service_active: GaugeVec::new(
                Opts::new(
                    "node_service_active",
                    "Whether a systemd service is active (1) or not (0).",
                ),
                &["service"],
            )?,
            scrape_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Adds a collector, registering its required services with the gate.
    pub fn register(&mut self, collector: Arc<dyn SourceCollector>) -> Result<(), GateError> {
        let required = self.gate.register(collector.required_services())?;
        info!(
            "Registered collector '{}' (services: {:?}, mask: {:#x})",
            collector.name(),
            collector.required_services(),
            required
        );
        self.registrations.push(Registration {
            collector,
            required,
        });
        Ok(())
    }

    /// Names of the registered collectors, in registration order.
    pub fn collectors(&self) -> Vec<&str> {
        self.registrations
            .iter()
            .map(|r| r.collector.name())
            .collect()
    }

    /// Descriptors of every metric that can appear in a scrape.
    pub fn describe(&self) -> Vec<&Desc> {
        let mut descs = self.service_active.desc();
        for registration in &self.registrations {
            descs.extend(registration.collector.describe());
        }
        descs
    }

    /// Runs one collection cycle.
    ///
    /// Cycles are serialized, so a collector never overlaps with itself.
    /// Dropping the returned future aborts every collector task it started.
    #[instrument(skip(self))]
    pub async fn collect_all(&self) -> Scrape {
        let _guard = self.scrape_lock.lock().await;
        let start = Instant::now();
        let mut scrape = Scrape::default();

        let active = match self.gate.resolve(self.status.as_ref()).await {
            Ok(active) => active,
            Err(e) => {
                scrape.errors.push(e.into());
                scrape.skipped = self.collectors().iter().map(|n| n.to_string()).collect();
                return scrape;
            }
        };

        let sink = MetricSink::default();
        if !active.services.is_empty() {
            self.service_active.reset();
            for (service, running) in &active.services {
                self.service_active
                    .with_label_values(&[service.as_str()])
                    .set(if *running { 1.0 } else { 0.0 });
            }
            sink.append(self.service_active.collect());
        }

        let mut tasks = JoinSet::new();
        let mut task_names = HashMap::new();
        for registration in &self.registrations {
            let name = registration.collector.name().to_string();
            if !is_eligible(registration.required, active.mask) {
                debug!("Skipping collector '{}': required service inactive", name);
                scrape.skipped.push(name);
                continue;
            }

            let collector = Arc::clone(&registration.collector);
            let sink = sink.clone();
            let handle = tasks.spawn(async move {
                let families = collector.collect().await?;
                sink.append(families);
                Ok::<(), CollectorError>(())
            });
            task_names.insert(handle.id(), name.clone());
            scrape.ran.push(name);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => scrape.errors.push(e.into()),
                Err(join_error) => {
                    let collector = task_names
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    scrape
                        .errors
                        .push(CollectorError::Panicked { collector }.into());
                }
            }
        }

        let mut families = sink.drain();
        families.sort_by(|a, b| a.get_name().cmp(b.get_name()));
        scrape.families = families;

        debug!(
            "Scrape finished in {:?}: ran={:?} skipped={:?} errors={}",
            start.elapsed(),
            scrape.ran,
            scrape.skipped,
            scrape.errors.len()
        );
        scrape
    }

    /// Encodes a scrape in the Prometheus text format.
    ///
    /// Families come out sorted by name and samples by label values.
    pub fn render(&self, scrape: &Scrape) -> Result<String, Error> {
        let registry = Registry::new();
        registry.register(Box::new(Snapshot {
            descs: self.describe().into_iter().cloned().collect(),
            families: scrape.families.clone(),
        }))?;

        let families = registry.gather();
        let mut buffer = Vec::with_capacity(BUFFER_CAP);
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Prometheus(prometheus::Error::Msg(e.to_string())))
    }

    /// Closes every collector.
    pub fn close(&self) {
        for registration in &self.registrations {
            debug!("Closing collector '{}'", registration.collector.name());
            registration.collector.close();
        }
    }
}
