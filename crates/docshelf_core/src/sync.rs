use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use reqwest::Url;
use tracing::{debug, info, warn};

use crate::http::HttpTransport;
use crate::manifest::{ManifestClient, VersionDescriptor};
use crate::store::{KeyValueStore, SqliteStore, load_versions_cache, save_versions_cache};

pub fn structural_key(version: &VersionDescriptor) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        version.slug,
        version.page_url,
        version.zip_url.as_deref().unwrap_or(""),
        version.sha.as_deref().unwrap_or(""),
        version.r#ref.as_deref().unwrap_or("")
    )
}

pub fn same_versions(a: &[VersionDescriptor], b: &[VersionDescriptor]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(left, right)| structural_key(left) == structural_key(right))
}

/// A connectivity report. `None` means the platform did not say.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub is_connected: Option<bool>,
    pub is_internet_reachable: Option<bool>,
}

impl Connectivity {
    pub fn online() -> Self {
        Self {
            is_connected: Some(true),
            is_internet_reachable: Some(true),
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: Some(false),
            is_internet_reachable: Some(false),
        }
    }

    /// Connected and not explicitly unreachable; unknown reachability counts
    /// as reachable.
    pub fn is_online(&self) -> bool {
        self.is_connected == Some(true) && self.is_internet_reachable != Some(false)
    }
}

pub trait ConnectivityProbe {
    fn current(&mut self) -> Connectivity;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedConnectivity(pub Connectivity);

impl ConnectivityProbe for FixedConnectivity {
    fn current(&mut self) -> Connectivity {
        self.0
    }
}

/// Resolves the target host (connected) and opens a TCP connection to it
/// (reachable).
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target_url: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target_url: &str, timeout: Duration) -> Self {
        Self {
            target_url: target_url.to_string(),
            timeout,
        }
    }
}

impl ConnectivityProbe for TcpProbe {
    fn current(&mut self) -> Connectivity {
        let Some((host, port)) = Url::parse(&self.target_url).ok().and_then(|url| {
            let host = url.host_str()?.to_string();
            Some((host, url.port_or_known_default()?))
        }) else {
            warn!(url = %self.target_url, "cannot probe connectivity for url");
            return Connectivity::default();
        };

        let addrs: Vec<_> = match (host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(error) => {
                debug!(%host, %error, "host lookup failed");
                return Connectivity::offline();
            }
        };
        let reachable = addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok());
        Connectivity {
            is_connected: Some(!addrs.is_empty()),
            is_internet_reachable: Some(reachable),
        }
    }
}

/// Turns a stream of connectivity reports into sync triggers: the first
/// online report and every later offline-to-online transition.
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    was_online: Option<bool>,
}

impl ConnectivityMonitor {
    pub fn observe(&mut self, report: Connectivity) -> bool {
        let online = report.is_online();
        let trigger = online && self.was_online != Some(true);
        self.was_online = Some(online);
        trigger
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Throttled,
    AlreadyRunning,
    Unchanged { count: usize },
    Updated { versions: Vec<VersionDescriptor> },
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Default)]
struct SyncState {
    in_flight: bool,
    last_sync_at: Option<Instant>,
    versions: Vec<VersionDescriptor>,
}

#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    min_interval: Duration,
    state: Arc<Mutex<SyncState>>,
}

impl SyncCoordinator {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_versions(min_interval, Vec::new())
    }

    pub fn with_versions(min_interval: Duration, versions: Vec<VersionDescriptor>) -> Self {
        Self {
            min_interval,
            state: Arc::new(Mutex::new(SyncState {
                versions,
                ..SyncState::default()
            })),
        }
    }

    pub fn versions(&self) -> Vec<VersionDescriptor> {
        self.lock().versions.clone()
    }

    pub fn last_sync_at(&self) -> Option<Instant> {
        self.lock().last_sync_at
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    pub fn sync_if_needed(
        &self,
        client: &ManifestClient,
        http: &mut dyn HttpTransport,
        store: &dyn KeyValueStore,
        now: Instant,
    ) -> SyncOutcome {
        if let Err(skipped) = self.try_begin(now) {
            return skipped;
        }
        let outcome = self.refresh(client, http, store, now, &AtomicBool::new(false));
        self.lock().in_flight = false;
        outcome
    }

    /// Runs the refresh on a worker thread and delivers the outcome over a
    /// channel. The worker opens its own store at `db_path`.
    pub fn spawn_sync<T>(&self, client: ManifestClient, mut http: T, db_path: PathBuf) -> BackgroundSync
    where
        T: HttpTransport + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let now = Instant::now();
        if let Err(skipped) = self.try_begin(now) {
            let _ = sender.send(skipped);
            return BackgroundSync {
                receiver,
                cancel,
                handle: None,
            };
        }

        let coordinator = self.clone();
        let worker_cancel = Arc::clone(&cancel);
        let handle = thread::spawn(move || {
            let outcome = match SqliteStore::open_at(&db_path) {
                Ok(store) => coordinator.refresh(&client, &mut http, &store, now, &worker_cancel),
                Err(error) => SyncOutcome::Failed {
                    error: format!("{error:#}"),
                },
            };
            coordinator.lock().in_flight = false;
            let _ = sender.send(outcome);
        });
        BackgroundSync {
            receiver,
            cancel,
            handle: Some(handle),
        }
    }

    fn try_begin(&self, now: Instant) -> Result<(), SyncOutcome> {
        let mut state = self.lock();
        if let Some(last) = state.last_sync_at
            && now.saturating_duration_since(last) < self.min_interval
        {
            return Err(SyncOutcome::Throttled);
        }
        if state.in_flight {
            return Err(SyncOutcome::AlreadyRunning);
        }
        state.in_flight = true;
        Ok(())
    }

    fn refresh(
        &self,
        client: &ManifestClient,
        http: &mut dyn HttpTransport,
        store: &dyn KeyValueStore,
        now: Instant,
        cancel: &AtomicBool,
    ) -> SyncOutcome {
        let fetched = match client.fetch_versions(http) {
            Ok(versions) => versions,
            Err(error) => {
                warn!("version refresh failed; keeping cached list: {error:#}");
                return SyncOutcome::Failed {
                    error: format!("{error:#}"),
                };
            }
        };
        if cancel.load(Ordering::SeqCst) {
            debug!("version refresh cancelled before persisting");
            return SyncOutcome::Cancelled;
        }

        let changed = match load_versions_cache(store) {
            Ok(cached) => cached.is_none_or(|cache| !same_versions(&cache.versions, &fetched)),
            Err(error) => {
                return SyncOutcome::Failed {
                    error: format!("{error:#}"),
                };
            }
        };
        if changed && let Err(error) = save_versions_cache(store, &fetched) {
            warn!("failed to persist refreshed versions: {error:#}");
            return SyncOutcome::Failed {
                error: format!("{error:#}"),
            };
        }

        let mut state = self.lock();
        state.last_sync_at = Some(now);
        if changed {
            info!(count = fetched.len(), "version list updated");
            state.versions = fetched.clone();
            SyncOutcome::Updated { versions: fetched }
        } else {
            debug!(count = fetched.len(), "version list unchanged");
            SyncOutcome::Unchanged {
                count: fetched.len(),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct BackgroundSync {
    receiver: Receiver<SyncOutcome>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundSync {
    /// Asks the worker not to persist its result. A fetch already in
    /// progress still runs to completion.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn try_outcome(&self) -> Option<SyncOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(worker_gone()),
        }
    }

    pub fn wait(mut self) -> SyncOutcome {
        let outcome = self.receiver.recv().unwrap_or_else(|_| worker_gone());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        outcome
    }
}

fn worker_gone() -> SyncOutcome {
    SyncOutcome::Failed {
        error: "sync worker exited without reporting".to_string(),
    }
}
