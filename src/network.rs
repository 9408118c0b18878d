use futures::future::BoxFuture;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::shared::StateWriter;
use crate::state::{NetworkState, NetworkStatus, SystemState};
use crate::storage::Store;
use crate::DeviceError;

/// What the radio reports about the station link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Associating,
    Connected { ip: String },
    /// Association or authentication was refused.
    Failed,
}

/// Station-mode WiFi radio. Implemented by the board support layer.
pub trait Radio: Send {
    /// Blocking scan; returns SSIDs in the order the driver reports them.
    fn scan(&mut self) -> BoxFuture<'_, Result<Vec<String>, DeviceError>>;

    /// Start associating with `ssid`. Returns once the attempt is underway.
    fn begin(&mut self, ssid: &str, password: &str) -> Result<(), DeviceError>;

    /// Drop the association. `erase` also forgets driver-stored credentials.
    fn disconnect(&mut self, erase: bool);

    fn link(&mut self) -> LinkStatus;
}

struct PendingConnect {
    started: Instant,
    timeout: Duration,
}

/// Owns the radio and is the only writer of [`NetworkState`].
pub struct NetworkManager<R: Radio> {
    radio: R,
    state: StateWriter<NetworkState>,
    pending: Option<PendingConnect>,
}

impl<R: Radio> NetworkManager<R> {
    pub fn new(radio: R, state: StateWriter<NetworkState>) -> Self {
        Self {
            radio,
            state,
            pending: None,
        }
    }

    pub fn state(&self) -> &StateWriter<NetworkState> {
        &self.state
    }

    /// Pre-seed credentials loaded at boot so the UI can name the network.
    pub fn preload_credentials(&self, ssid: &str, password: &str, status: NetworkStatus) {
        self.state.update(|s| {
            s.selected_ssid = ssid.to_string();
            s.selected_pass = password.to_string();
            s.status = status;
        });
    }

    // --- Scanning ---

    pub async fn process_scan(&mut self) {
        info!("WiFi scanning...");
        self.radio.disconnect(false);
        self.pending = None;
        self.state.update(|s| {
            s.status = NetworkStatus::Scanning;
            s.connected = false;
            s.found_ssids.clear();
        });

        let found = match self.radio.scan().await {
            Ok(names) => dedup_ssids(names),
            Err(e) => {
                warn!(error = %e, "WiFi scan failed, reporting no networks");
                Vec::new()
            }
        };

        info!(count = found.len(), "WiFi scan complete");
        self.state.update(|s| {
            s.found_ssids = found;
            s.status = NetworkStatus::ScanResults;
        });
    }

    // --- Connect ---

    pub fn process_connect(&mut self, ssid: &str, password: &str, timeout: Duration, now: Instant) {
        info!(ssid, timeout_ms = timeout.as_millis() as u64, "Connecting");
        self.radio.disconnect(false);
        self.state.update(|s| {
            s.selected_ssid = ssid.to_string();
            s.selected_pass = password.to_string();
            s.status = NetworkStatus::Connecting;
            s.connected = false;
        });

        if let Err(e) = self.radio.begin(ssid, password) {
            error!(error = %e, "Radio refused to start association");
            self.fail_connect();
            return;
        }

        self.pending = Some(PendingConnect {
            started: now,
            timeout,
        });
    }

    /// Per-tick link bookkeeping.
    pub fn update(&mut self, now: Instant, store: &Store, system: &StateWriter<SystemState>) {
        let status = self.state.snapshot().status;
        match status {
            NetworkStatus::Connecting => self.handle_connecting(now, store, system),
            NetworkStatus::Connected => self.watch_link(),
            _ => {}
        }
    }

    fn handle_connecting(
        &mut self,
        now: Instant,
        store: &Store,
        system: &StateWriter<SystemState>,
    ) {
        let Some(pending) = self.pending.as_ref() else {
            // Boot marks CONNECTING before the queued request is drained.
            return;
        };
        let elapsed = now.saturating_duration_since(pending.started);
        let timeout = pending.timeout;

        match self.radio.link() {
            LinkStatus::Connected { ip } => {
                self.pending = None;
                info!(%ip, "WiFi connected");
                self.state.update(|s| {
                    s.status = NetworkStatus::Connected;
                    s.connected = true;
                    s.ip = ip;
                });

                let snapshot = self.state.snapshot();
                let (ssid, password) = (snapshot.selected_ssid, snapshot.selected_pass);
                system.update(|s| s.setup_complete = true);
                if let Err(e) = store.update_config(|c| {
                    c.ssid = ssid;
                    c.password = password;
                    c.setup_complete = true;
                }) {
                    error!(error = %e, "Failed to persist network config");
                }
            }
            LinkStatus::Failed => {
                warn!("WiFi association failed");
                self.fail_connect();
            }
            _ if elapsed >= timeout => {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "WiFi connect timed out");
                self.fail_connect();
            }
            _ => {}
        }
    }

    fn fail_connect(&mut self) {
        self.pending = None;
        self.radio.disconnect(false);
        self.state.update(|s| {
            s.status = NetworkStatus::Error;
            s.connected = false;
        });
    }

    fn watch_link(&mut self) {
        let link = self.radio.link();
        self.state.update_if(|s| match link {
            LinkStatus::Connected { ip } => {
                if s.connected && s.ip == ip {
                    return false;
                }
                info!(%ip, "WiFi link restored");
                s.connected = true;
                s.ip = ip;
                true
            }
            _ => {
                if !s.connected {
                    return false;
                }
                warn!("WiFi link lost");
                s.connected = false;
                true
            }
        });
    }

    // --- Reset ---

    pub fn process_reset(&mut self, store: &Store, system: &StateWriter<SystemState>) {
        info!("WiFi reset requested");
        self.radio.disconnect(true);
        self.pending = None;

        if let Err(e) = store.reset_config() {
            error!(error = %e, "Failed to remove config");
        }
        system.update(|s| {
            s.setup_complete = false;
            s.account_linked = false;
        });

        self.state.update(|s| {
            s.selected_ssid.clear();
            s.selected_pass.clear();
            s.connected = false;
            s.ip = NetworkState::default().ip;
            s.status = NetworkStatus::Idle;
        });
        debug!("WiFi reset complete");
    }
}

/// Drop empty and repeated names, keeping first-seen order.
pub fn dedup_ssids(names: Vec<String>) -> Vec<String> {
    let mut found: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !name.is_empty() && !found.contains(&name) {
            found.push(name);
        }
    }
    found
}
