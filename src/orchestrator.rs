//! One scan run: discovery, capture, aggregation, persistence, archiving and
//! publication, in that order.
//!
//! The orchestrator holds no per-run state, so overlapping runs are
//! independent; keeping to one active run is up to whoever triggers it.
use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregate::aggregate;
use crate::archive::ArchiveDispatcher;
use crate::discovery::DiscoveryProbe;
use crate::events::{Event, EventChannel};
use crate::services::ServiceTable;
use crate::snapshot::SnapshotSource;
use crate::store::RecordStore;
use crate::types::{now_local, ScanResult};

pub const STATUS_IN_PROGRESS: &str = "scan in progress";

/// Pipeline stage, logged as a run moves through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Aggregating,
    Persisting,
    Archiving,
    Error,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanState::Idle => "idle",
            ScanState::Scanning => "scanning",
            ScanState::Aggregating => "aggregating",
            ScanState::Persisting => "persisting",
            ScanState::Archiving => "archiving",
            ScanState::Error => "error",
        };
        f.write_str(s)
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// A result was published. `archive` is the in-flight upload, if one was
    /// started; the run does not wait for it.
    Published {
        result: Box<ScanResult>,
        persisted: bool,
        archive: Option<JoinHandle<bool>>,
    },
    /// The probe failed; an error event was published and nothing was stored.
    Failed(String),
}

impl RunOutcome {
    pub fn result(&self) -> Option<&ScanResult> {
        match self {
            RunOutcome::Published { result, .. } => Some(result),
            RunOutcome::Failed(_) => None,
        }
    }
}

/// What to sweep.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub network: String,
    pub ports: Vec<u16>,
}

pub struct Orchestrator {
    target: ScanTarget,
    probe: Arc<dyn DiscoveryProbe>,
    snapshot: Arc<dyn SnapshotSource>,
    services: Arc<ServiceTable>,
    store: Arc<RecordStore>,
    archive: Option<Arc<ArchiveDispatcher>>,
    events: EventChannel,
}

impl Orchestrator {
    pub fn new(
        target: ScanTarget,
        probe: Arc<dyn DiscoveryProbe>,
        snapshot: Arc<dyn SnapshotSource>,
        services: Arc<ServiceTable>,
        store: Arc<RecordStore>,
        events: EventChannel,
    ) -> Self {
        Self {
            target,
            probe,
            snapshot,
            services,
            store,
            archive: None,
            events,
        }
    }

    pub fn with_archive(mut self, archive: Arc<ArchiveDispatcher>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn target(&self) -> &ScanTarget {
        &self.target
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Start a run on its own task and return immediately.
    pub fn trigger(self: &Arc<Self>) -> JoinHandle<RunOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Drive one run to completion. Subscribers always get either a `result`
    /// or an `error` event from it.
    pub async fn run(&self) -> RunOutcome {
        let network = self.target.network.as_str();
        let started_at = now_local();

        transition(ScanState::Idle, ScanState::Scanning);
        self.events.status(STATUS_IN_PROGRESS);
        info!(network, ports = self.target.ports.len(), "scan started");

        let discovered = match self.probe.discover(network, &self.target.ports).await {
            Ok(hosts) => hosts,
            Err(e) => {
                transition(ScanState::Scanning, ScanState::Error);
                error!(network, "scan aborted: {e}");
                let message = e.to_string();
                self.events.publish(Event::Error(message.clone()));
                transition(ScanState::Error, ScanState::Idle);
                return RunOutcome::Failed(message);
            }
        };

        let snapshot = match self.snapshot.capture().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("continuing without screenshot: {e}");
                None
            }
        };

        transition(ScanState::Scanning, ScanState::Aggregating);
        let result = aggregate(network, discovered, snapshot, started_at, &self.services);

        transition(ScanState::Aggregating, ScanState::Persisting);
        let (result, persisted) = match self.store.persist(result.clone()).await {
            Ok(stored) => (stored, true),
            Err(e) => {
                warn!("scan record not persisted, publishing anyway: {e}");
                (result, false)
            }
        };

        let archive = match (&self.archive, persisted, result.filename()) {
            (Some(dispatcher), true, Some(filename)) => {
                transition(ScanState::Persisting, ScanState::Archiving);
                Some(dispatcher.spawn(self.store.path_of(filename)))
            }
            _ => None,
        };

        info!(
            network,
            hosts = result.hosts().len(),
            file = result.filename().unwrap_or("<not stored>"),
            "scan finished"
        );
        self.events.publish(Event::Result(Box::new(result.clone())));
        transition(
            if archive.is_some() {
                ScanState::Archiving
            } else {
                ScanState::Persisting
            },
            ScanState::Idle,
        );

        RunOutcome::Published {
            result: Box::new(result),
            persisted,
            archive,
        }
    }
}

fn transition(from: ScanState, to: ScanState) {
    debug!(%from, %to, "scan state");
}
