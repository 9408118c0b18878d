//! Render-side state consumer.
//!
//! [`RenderContext`] polls the shared state every render tick, decides which
//! screen the [`Presenter`] should show, and feeds it now-playing frames.
//! Screens are only re-shown when the status behind them changes. Art is
//! rescaled on a blocking worker; at most one rescale is in flight and its
//! result is dropped if newer art arrived meanwhile.

use image::{Rgb, RgbImage};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::art::Rescaler;
use crate::service::DeviceHandles;
use crate::settings::Settings;
use crate::state::{
    AccountState, AccountStatus, ActivityStatus, NetworkState, NetworkStatus, TrackInfo,
};
use crate::DeviceError;

/// One ready-to-draw now-playing screen.
#[derive(Debug, Clone, Copy)]
pub struct NowPlayingFrame<'a> {
    /// `size`×`size` RGB565 pixels; empty for the placeholder.
    pub pixels: &'a [u16],
    pub size: u32,
    pub background: Rgb<u8>,
    pub track: &'a TrackInfo,
}

impl NowPlayingFrame<'_> {
    pub fn is_placeholder(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// The display. Implemented by the board's UI layer.
pub trait Presenter {
    fn show_onboarding(&mut self);
    fn show_spinner(&mut self, message: &str);
    fn show_network_list(&mut self, ssids: &[String]);
    /// Offers "try again" and "reconnect".
    fn show_wifi_error(&mut self, ssid: &str);
    fn show_context(&mut self, message: &str);
    /// QR code for the authorization URL.
    fn show_link(&mut self, auth_url: &str);
    fn show_link_error(&mut self);
    fn show_account_error(&mut self);
    fn show_player(&mut self);
    fn show_sleep(&mut self);
    fn show_failure(&mut self, message: &str);

    fn apply_now_playing(&mut self, frame: &NowPlayingFrame<'_>);
    fn update_track_text(&mut self, track: &TrackInfo);
    fn set_track_progress(&mut self, progress_ms: u64, duration_ms: u64);
}

/// Show the fatal failure screen for a boot error.
pub fn present_failure<P: Presenter>(presenter: &mut P, error: &DeviceError) {
    warn!(error = %error, "Boot failed");
    presenter.show_failure("Something went wrong!");
}

struct RescaleJob {
    epoch: u64,
    background: Rgb<u8>,
    handle: JoinHandle<Rescaler>,
}

pub struct RenderContext<P: Presenter> {
    presenter: P,
    handles: DeviceHandles,
    connect_timeout: std::time::Duration,
    retry_connect_timeout: std::time::Duration,
    art_size: u32,
    render_tick: std::time::Duration,

    last_network: Option<NetworkStatus>,
    last_account: Option<AccountStatus>,
    last_auth_url: String,
    last_activity: ActivityStatus,
    seen_art: Option<u64>,
    seen_text: Option<u64>,
    last_progress: Option<(u64, u64)>,

    rescaler: Option<Rescaler>,
    job: Option<RescaleJob>,
}

impl<P: Presenter> RenderContext<P> {
    pub fn new(presenter: P, handles: DeviceHandles, settings: &Settings) -> Self {
        Self {
            presenter,
            handles,
            connect_timeout: settings.connect_timeout,
            retry_connect_timeout: settings.retry_connect_timeout(),
            art_size: settings.art_target_size,
            render_tick: settings.render_tick,
            last_network: None,
            last_account: None,
            last_auth_url: String::new(),
            last_activity: ActivityStatus::Active,
            seen_art: None,
            seen_text: None,
            last_progress: None,
            rescaler: Some(Rescaler::new()),
            job: None,
        }
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    pub fn rescale_in_flight(&self) -> bool {
        self.job.is_some()
    }

    // --- User actions ---

    pub fn request_scan(&self) {
        self.handles.commands.request_scan();
    }

    pub fn select_network(&self, ssid: &str, password: &str) {
        self.handles
            .commands
            .request_connect(ssid, password, self.connect_timeout);
    }

    /// "Try again" on the WiFi error screen: same network, longer timeout.
    pub fn retry_connect(&self) {
        let network = self.handles.network.snapshot();
        self.handles.commands.request_connect(
            &network.selected_ssid,
            &network.selected_pass,
            self.retry_connect_timeout,
        );
    }

    pub fn request_reset(&self) {
        self.handles.commands.request_reset();
    }

    pub fn request_relink(&self) {
        self.handles.commands.request_relink();
    }

    // --- Loop ---

    pub async fn run(mut self) {
        info!("Render loop started");
        while !self.handles.shutdown.is_shutdown() {
            self.update().await;
            sleep(self.render_tick).await;
        }
        if let Some(job) = self.job.take() {
            job.handle.abort();
        }
        info!("Render loop stopped");
    }

    /// One render tick.
    pub async fn update(&mut self) {
        let network = self.handles.network.snapshot();
        self.dispatch_network(&network);
        if network.status != NetworkStatus::Connected {
            return;
        }

        let account = self.handles.account.snapshot();
        self.dispatch_account(&account);
        if account.status != AccountStatus::Ready {
            return;
        }

        let activity = self.handles.system.read(|s| s.activity);
        if activity != self.last_activity {
            debug!(from = ?self.last_activity, to = ?activity, "Activity changed");
            if activity == ActivityStatus::Sleep {
                self.presenter.show_sleep();
            } else if self.last_activity == ActivityStatus::Sleep {
                self.presenter.show_player();
                self.mark_unseen();
            }
            self.last_activity = activity;
        }
        if activity == ActivityStatus::Sleep {
            return;
        }

        self.finish_rescale(&account).await;
        self.refresh_now_playing(&account);
    }

    fn dispatch_network(&mut self, network: &NetworkState) {
        if self.last_network == Some(network.status) {
            return;
        }
        debug!(status = ?network.status, "Network screen");
        match network.status {
            NetworkStatus::Idle => self.presenter.show_onboarding(),
            NetworkStatus::Connecting => self
                .presenter
                .show_spinner(&format!("Connecting to {}", network.selected_ssid)),
            NetworkStatus::Scanning => self.presenter.show_spinner("Searching for networks..."),
            NetworkStatus::ScanResults => self.presenter.show_network_list(&network.found_ssids),
            NetworkStatus::Connected => {
                self.presenter.show_context("WiFi Connected!");
                self.last_account = None;
            }
            NetworkStatus::Error => self.presenter.show_wifi_error(&network.selected_ssid),
        }
        self.last_network = Some(network.status);
    }

    fn dispatch_account(&mut self, account: &AccountState) {
        let link_screen = matches!(
            account.status,
            AccountStatus::NeedLink | AccountStatus::Linking
        );
        let url_moved = link_screen && account.auth_url != self.last_auth_url;
        if self.last_account == Some(account.status) && !url_moved {
            return;
        }

        debug!(status = account.status.as_str(), "Account screen");
        match account.status {
            // Context screen stays up until the account work starts.
            AccountStatus::Idle => {}
            AccountStatus::Initializing => self.presenter.show_spinner("Signing in..."),
            AccountStatus::NeedLink | AccountStatus::Linking => {
                let already_shown = matches!(
                    self.last_account,
                    Some(AccountStatus::NeedLink | AccountStatus::Linking)
                );
                if !already_shown || url_moved {
                    self.presenter.show_link(&account.auth_url);
                    self.last_auth_url = account.auth_url.clone();
                }
            }
            AccountStatus::Authenticating => self.presenter.show_spinner("Linking account..."),
            AccountStatus::Ready => {
                self.presenter.show_player();
                self.last_activity = ActivityStatus::Active;
                self.mark_unseen();
            }
            AccountStatus::LinkError => self.presenter.show_link_error(),
            AccountStatus::Error => self.presenter.show_account_error(),
        }
        self.last_account = Some(account.status);
    }

    fn mark_unseen(&mut self) {
        self.seen_art = None;
        self.seen_text = None;
        self.last_progress = None;
    }

    fn art_pending(&self, account: &AccountState) -> bool {
        self.seen_art
            .map(|seen| account.needs_art_update(seen))
            .unwrap_or(true)
    }

    fn text_pending(&self, account: &AccountState) -> bool {
        self.seen_text
            .map(|seen| account.needs_text_update(seen))
            .unwrap_or(true)
    }

    async fn finish_rescale(&mut self, account: &AccountState) {
        let finished = self.job.as_ref().map(|j| j.handle.is_finished()).unwrap_or(false);
        if !finished {
            return;
        }
        let Some(job) = self.job.take() else {
            return;
        };

        let rescaler = match job.handle.await {
            Ok(rescaler) => rescaler,
            Err(e) => {
                warn!(error = %e, "Rescale worker failed");
                self.rescaler = Some(Rescaler::new());
                return;
            }
        };

        if job.epoch == account.art_epoch {
            let frame = NowPlayingFrame {
                pixels: rescaler.pixels(),
                size: rescaler.size(),
                background: job.background,
                track: &account.track,
            };
            self.presenter.apply_now_playing(&frame);
            self.seen_art = Some(job.epoch);
            self.seen_text = Some(account.text_epoch);
            self.last_progress = Some((account.track.progress_ms, account.track.duration_ms));
        } else {
            trace!(job = job.epoch, current = account.art_epoch, "Dropping stale art");
        }
        self.rescaler = Some(rescaler);
    }

    fn refresh_now_playing(&mut self, account: &AccountState) {
        if self.art_pending(account) && self.job.is_none() {
            self.start_art(account);
        } else if self.text_pending(account) && self.job.is_none() {
            self.presenter.update_track_text(&account.track);
            self.seen_text = Some(account.text_epoch);
        }

        let progress = (account.track.progress_ms, account.track.duration_ms);
        if self.last_progress != Some(progress) && self.seen_art.is_some() {
            self.presenter.set_track_progress(progress.0, progress.1);
            self.last_progress = Some(progress);
        }
    }

    fn start_art(&mut self, account: &AccountState) {
        let frame = self.handles.frames.snapshot();
        if frame.epoch != account.art_epoch {
            // Frame and status are published separately; catch it next tick.
            return;
        }

        let Some(image) = frame.image else {
            let placeholder = NowPlayingFrame {
                pixels: &[],
                size: self.art_size,
                background: frame.background,
                track: &account.track,
            };
            self.presenter.apply_now_playing(&placeholder);
            self.seen_art = Some(frame.epoch);
            self.seen_text = Some(account.text_epoch);
            self.last_progress = Some((account.track.progress_ms, account.track.duration_ms));
            return;
        };

        let Some(rescaler) = self.rescaler.take() else {
            return;
        };
        trace!(epoch = frame.epoch, "Starting rescale");
        let size = self.art_size;
        let handle = tokio::task::spawn_blocking(move || rescale_into(rescaler, image, size));
        self.job = Some(RescaleJob {
            epoch: frame.epoch,
            background: frame.background,
            handle,
        });
    }
}

fn rescale_into(mut rescaler: Rescaler, image: Arc<RgbImage>, size: u32) -> Rescaler {
    rescaler.rescale(&image, size);
    rescaler
}
