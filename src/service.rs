//! Boot sequence and the service loop.
//!
//! The service loop owns every blocking collaborator (radio, account API,
//! storage) and runs on its own OS thread with a single-threaded runtime.
//! The render side talks to it only through the command channel and reads
//! its output through [`DeviceHandles`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::account::{AccountConfig, AccountManager};
use crate::art::{ArtLoader, ArtSource};
use crate::commands::{command_channel, Command, CommandReceiver, CommandSender};
use crate::network::{NetworkManager, Radio};
use crate::power::{Backlight, PowerPolicy, PowerTransition};
use crate::settings::Settings;
use crate::shared::{shared, StateReader, StateWriter};
use crate::state::{
    AccountState, AccountStatus, ArtFrame, NetworkState, NetworkStatus, SystemState,
};
use crate::storage::{DeviceConfig, Secrets, Store};
use crate::web_api::AccountApi;
use crate::DeviceError;

/// Everything read from flash before the loops start.
#[derive(Debug)]
pub struct Boot {
    pub store: Store,
    /// Defaults when the file was missing or corrupt.
    pub config: DeviceConfig,
    pub secrets: Secrets,
    pub refresh_token: String,
}

/// Mount storage and load the persisted documents.
///
/// A storage or secrets failure is fatal; the caller shows the failure
/// screen and stops.
pub fn boot(settings: &Settings) -> Result<Boot, DeviceError> {
    let store = Store::mount(&settings.data_dir)?;

    let config = match store.load_config() {
        Some(config) => config,
        None => {
            info!("No usable config, starting onboarding");
            DeviceConfig::default()
        }
    };

    let secrets = store.load_secrets()?;
    let refresh_token = store.load_refresh_token();
    if refresh_token.is_empty() {
        info!("No stored account link");
    } else {
        info!("Loaded existing refresh token");
    }

    Ok(Boot {
        store,
        config,
        secrets,
        refresh_token,
    })
}

/// Stops a running [`ServiceLoop`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop_signal: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop_signal.load(Ordering::Relaxed)
    }
}

/// Read views and the command sender handed to the render side.
#[derive(Debug, Clone)]
pub struct DeviceHandles {
    pub network: StateReader<NetworkState>,
    pub account: StateReader<AccountState>,
    pub system: StateReader<SystemState>,
    pub frames: StateReader<ArtFrame>,
    pub commands: CommandSender,
    pub shutdown: ShutdownHandle,
}

pub struct ServiceLoop<R: Radio, A: AccountApi, B: Backlight> {
    store: Store,
    commands: CommandReceiver,
    network: NetworkManager<R>,
    account: AccountManager<A>,
    power: PowerPolicy<B>,
    system: StateWriter<SystemState>,
    stop_signal: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl<R, A, B> ServiceLoop<R, A, B>
where
    R: Radio + 'static,
    A: AccountApi + 'static,
    B: Backlight + 'static,
{
    /// Wire the managers from the boot result and seed the shared state.
    pub fn new(
        settings: &Settings,
        boot: Boot,
        radio: R,
        api: A,
        art: Arc<dyn ArtSource>,
        backlight: B,
    ) -> (Self, DeviceHandles) {
        let Boot {
            store,
            config,
            secrets,
            refresh_token,
        } = boot;

        let (commands_tx, commands_rx) = command_channel();

        let (system, system_rx) = shared(SystemState {
            setup_complete: config.setup_complete,
            account_linked: config.account_linked,
            ..SystemState::default()
        });
        let (network_tx, network_rx) = shared(NetworkState::default());
        let (account_tx, account_rx) = shared(AccountState {
            client_id: secrets.client_id.clone(),
            refresh_token,
            ..AccountState::default()
        });
        let (frames_tx, frames_rx) = shared(ArtFrame::default());

        let network = NetworkManager::new(radio, network_tx);
        if config.setup_complete {
            if !config.ssid.is_empty() && !config.password.is_empty() {
                // Show CONNECTING straight away; the queued request does the work.
                network.preload_credentials(&config.ssid, &config.password, NetworkStatus::Connecting);
                commands_tx.request_connect(&config.ssid, &config.password, settings.connect_timeout);
            } else {
                warn!("Setup marked complete but no credentials stored");
                network.preload_credentials(&config.ssid, &config.password, NetworkStatus::Error);
            }
        }

        let account = AccountManager::new(
            api,
            ArtLoader::new(art),
            AccountConfig::from(settings),
            account_tx,
            frames_tx,
        );
        let power = PowerPolicy::new(
            backlight,
            settings.sleep_timeout,
            settings.pause_sleep_timeout,
            settings.active_tick,
            settings.idle_tick,
        );

        let stop_signal = Arc::new(AtomicBool::new(false));
        let shutdown_notify = Arc::new(Notify::new());
        let handles = DeviceHandles {
            network: network_rx,
            account: account_rx,
            system: system_rx,
            frames: frames_rx,
            commands: commands_tx,
            shutdown: ShutdownHandle {
                stop_signal: Arc::clone(&stop_signal),
                shutdown_notify: Arc::clone(&shutdown_notify),
            },
        };

        let service = Self {
            store,
            commands: commands_rx,
            network,
            account,
            power,
            system,
            stop_signal,
            shutdown_notify,
        };
        (service, handles)
    }

    /// One pass: commands, network, account, power. Returns the delay until
    /// the next pass.
    pub async fn tick(&mut self, now: Instant) -> Duration {
        for command in self.commands.drain() {
            trace!(command = command.name(), "Processing command");
            match command {
                Command::Scan => self.network.process_scan().await,
                Command::Connect {
                    ssid,
                    password,
                    timeout,
                } => self.network.process_connect(&ssid, &password, timeout, now),
                Command::Reset => self.network.process_reset(&self.store, &self.system),
                Command::Relink => self.account.relink(&self.store, &self.system),
            }
        }

        self.network.update(now, &self.store, &self.system);

        let network = self.network.state().snapshot();
        self.account
            .update(now, &network, &self.store, &self.system)
            .await;

        // Only the now-playing screen may idle or sleep.
        let account = self.account.state().snapshot();
        if account.status != AccountStatus::Ready {
            self.power.hold_active(&self.system);
        } else if network.connected {
            if let Some(transition) = self.power.tick(now, &account.track, &self.system) {
                debug!(?transition, "Activity changed");
                if transition == PowerTransition::Woke {
                    self.account.force_repaint();
                }
            }
        }

        self.power.tick_interval(self.system.snapshot().activity)
    }

    /// Tick until [`ShutdownHandle::shutdown`] is called.
    pub async fn run(mut self) {
        info!("Service loop started");
        loop {
            if self.stop_signal.load(Ordering::Relaxed) {
                break;
            }
            let wait = self.tick(Instant::now()).await;

            tokio::select! {
                biased;
                _ = self.shutdown_notify.notified() => break,
                _ = sleep(wait) => {}
            }
        }
        info!("Service loop stopped");
    }

    /// Run on a dedicated OS thread with its own current-thread runtime.
    pub fn spawn_pinned(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("service-loop".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "Failed to build service runtime");
                        return;
                    }
                };
                runtime.block_on(self.run());
            })
    }
}
