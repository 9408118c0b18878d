//! Account link and now-playing poller.
//!
//! [`AccountManager`] is the only writer of [`AccountState`] and of the
//! published [`ArtFrame`]. It is driven once per service tick and only does
//! work once the network link has been up for the grace period.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::art::ArtLoader;
use crate::listener::{CallbackListener, ListenerHandle};
use crate::models::{Playback, TokenGrant};
use crate::settings::Settings;
use crate::shared::StateWriter;
use crate::state::{
    AccountState, AccountStatus, ActivityStatus, ArtFrame, NetworkState, SystemState, TrackInfo,
    PLACEHOLDER_ART_URL,
};
use crate::storage::Store;
use crate::web_api::AccountApi;
use crate::DeviceError;

/// Access tokens are treated as expired this long before the server says so.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// What a playback poll means for the published state.
///
/// Exactly one outcome per poll. Only `ArtOnly` and `ArtAndBackground`
/// trigger a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing observable changed.
    NoChange,
    /// Same track and art; progress, device or play state moved.
    Progress,
    /// New track on the same album art.
    TextOnly,
    /// Same track, new art URL.
    ArtOnly,
    /// New track with new art: download and recompute the background.
    ArtAndBackground,
    /// Playback ended; fall back to the sentinel.
    Cleared,
}

/// Classify a poll result against what is currently published.
///
/// `published_art_url` is the URL of the last art that actually reached the
/// render side, so a failed download is retried on the next poll.
pub fn classify(
    current: &TrackInfo,
    published_art_url: &str,
    playback: Option<&Playback>,
) -> PollOutcome {
    let Some(p) = playback else {
        return if current.is_sentinel() && published_art_url == PLACEHOLDER_ART_URL {
            PollOutcome::NoChange
        } else {
            PollOutcome::Cleared
        };
    };

    let art_changed = p.art_url != published_art_url;
    if p.track_id != current.id {
        return if art_changed {
            PollOutcome::ArtAndBackground
        } else {
            PollOutcome::TextOnly
        };
    }
    if art_changed {
        return PollOutcome::ArtOnly;
    }
    if p.progress_ms != current.progress_ms
        || p.is_playing != current.is_playing
        || p.device_name != current.device_name
        || p.duration_ms != current.duration_ms
    {
        PollOutcome::Progress
    } else {
        PollOutcome::NoChange
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_factor = rand::random::<f32>() * 0.6 - 0.3; // -0.3 to +0.3
    let jitter = base.mul_f32(jitter_factor.abs());
    if jitter_factor >= 0.0 {
        base + jitter
    } else {
        base.saturating_sub(jitter)
    }
}

struct AccessToken {
    token: String,
    expires_at: Instant,
}

impl AccessToken {
    fn from_grant(grant: &TokenGrant, now: Instant) -> Self {
        let lifetime = Duration::from_secs(grant.expires_in).saturating_sub(EXPIRY_MARGIN);
        Self {
            token: grant.access_token.clone(),
            expires_at: now + lifetime,
        }
    }

    fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct Backoff {
    retry_at: Instant,
    delay: Duration,
}

// Art URL whose download keeps failing, and when to try it again.
struct ArtRetry {
    url: String,
    backoff: Backoff,
}

/// Timing knobs, split out of [`Settings`].
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub link_grace: Duration,
    pub poll_interval: Duration,
    pub idle_poll_interval: Duration,
    pub callback_port: u16,
    pub callback_timeout: Option<Duration>,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&Settings> for AccountConfig {
    fn from(s: &Settings) -> Self {
        Self {
            link_grace: s.link_grace,
            poll_interval: s.poll_interval,
            idle_poll_interval: s.idle_poll_interval,
            callback_port: s.callback_port,
            callback_timeout: s.callback_timeout,
            min_backoff: s.min_backoff,
            max_backoff: s.max_backoff,
        }
    }
}

pub struct AccountManager<A: AccountApi> {
    api: A,
    art: ArtLoader,
    config: AccountConfig,
    state: StateWriter<AccountState>,
    frames: StateWriter<ArtFrame>,

    link_up_since: Option<Instant>,
    gate_open: bool,
    device_ip: String,
    redirect_uri: String,

    listener: Option<ListenerHandle>,
    listener_busy: Arc<AtomicBool>,
    auth_code: Option<String>,

    access: Option<AccessToken>,
    backoff: Option<Backoff>,
    next_poll: Option<Instant>,
    published_art_url: String,
    /// A new album's art failed to load; recompute the background on retry.
    background_pending: bool,
    art_retry: Option<ArtRetry>,
}

impl<A: AccountApi> AccountManager<A> {
    pub fn new(
        api: A,
        art: ArtLoader,
        config: AccountConfig,
        state: StateWriter<AccountState>,
        frames: StateWriter<ArtFrame>,
    ) -> Self {
        Self {
            api,
            art,
            config,
            state,
            frames,
            link_up_since: None,
            gate_open: false,
            device_ip: String::new(),
            redirect_uri: String::new(),
            listener: None,
            listener_busy: Arc::new(AtomicBool::new(false)),
            auth_code: None,
            access: None,
            backoff: None,
            next_poll: None,
            published_art_url: PLACEHOLDER_ART_URL.to_string(),
            background_pending: false,
            art_retry: None,
        }
    }

    pub fn state(&self) -> &StateWriter<AccountState> {
        &self.state
    }

    pub fn status(&self) -> AccountStatus {
        self.state.snapshot().status
    }

    /// Address the running callback listener is bound to, if any.
    pub fn listener_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    fn set_status(&self, status: AccountStatus) {
        self.state.update_if(|s| {
            if s.status == status {
                return false;
            }
            info!(from = s.status.as_str(), to = status.as_str(), "Account status");
            s.status = status;
            true
        });
    }

    /// Per-tick entry point.
    pub async fn update(
        &mut self,
        now: Instant,
        network: &NetworkState,
        store: &Store,
        system: &StateWriter<SystemState>,
    ) {
        if !self.gate(now, network) {
            return;
        }

        match self.status() {
            AccountStatus::Idle => {
                if self.state.snapshot().refresh_token.is_empty() {
                    self.set_status(AccountStatus::NeedLink);
                } else {
                    self.set_status(AccountStatus::Initializing);
                }
            }
            AccountStatus::Initializing => self.handle_initializing(now, store).await,
            AccountStatus::NeedLink => self.handle_need_link(now).await,
            AccountStatus::Linking => self.handle_linking().await,
            AccountStatus::Authenticating => self.handle_authenticating(now, store, system).await,
            AccountStatus::Ready => self.handle_ready(now, store, system).await,
            AccountStatus::LinkError | AccountStatus::Error => {}
        }
    }

    // --- Gate ---

    // Open once the link has been up for `link_grace`. Losing the link
    // closes it and re-arms the grace period.
    fn gate(&mut self, now: Instant, network: &NetworkState) -> bool {
        if !network.connected {
            if self.gate_open {
                debug!("Account gate closed");
            }
            self.gate_open = false;
            self.link_up_since = None;
            return false;
        }

        let since = *self.link_up_since.get_or_insert(now);
        if self.gate_open {
            return true;
        }
        if now.saturating_duration_since(since) < self.config.link_grace {
            return false;
        }

        self.gate_open = true;
        self.open_gate(&network.ip);
        true
    }

    fn open_gate(&mut self, ip: &str) {
        let redirect_uri = format!("http://{}:{}/callback", ip, self.config.callback_port);
        let moved = !self.redirect_uri.is_empty() && redirect_uri != self.redirect_uri;
        self.device_ip = ip.to_string();
        self.redirect_uri = redirect_uri;

        match self.api.authorize_url(&self.redirect_uri, &self.device_ip) {
            Ok(url) => {
                debug!(%url, "Authorization URL ready");
                self.state.update(|s| s.auth_url = url);
            }
            Err(e) => error!(error = %e, "Failed to build authorization URL"),
        }

        // A listener bound under the old address can never receive the redirect.
        if moved && self.status() == AccountStatus::Linking {
            info!(ip, "Device address changed, restarting link");
            self.stop_listener();
            self.set_status(AccountStatus::NeedLink);
        }
    }

    // --- Link lifecycle ---

    async fn handle_initializing(&mut self, now: Instant, store: &Store) {
        if let Some(backoff) = &self.backoff {
            if now < backoff.retry_at {
                return;
            }
        }

        let refresh_token = self.state.snapshot().refresh_token;
        match self.api.refresh(&refresh_token).await {
            Ok(grant) => {
                self.backoff = None;
                self.accept_grant(&grant, now, store);
                self.enter_ready(now);
            }
            Err(e) if e.indicates_revoked_link() => {
                warn!(error = %e, "Stored account link rejected");
                self.backoff = None;
                self.set_status(AccountStatus::LinkError);
            }
            Err(e) => {
                let delay = self
                    .backoff
                    .as_ref()
                    .map(|b| (b.delay * 2).min(self.config.max_backoff))
                    .unwrap_or(self.config.min_backoff);
                let wait = jittered(delay);
                warn!(error = %e, wait_ms = wait.as_millis() as u64, "Token refresh failed, retrying");
                self.backoff = Some(Backoff {
                    retry_at: now + wait,
                    delay,
                });
            }
        }
    }

    async fn handle_need_link(&mut self, now: Instant) {
        if let Some(backoff) = &self.backoff {
            if now < backoff.retry_at {
                return;
            }
        }

        match CallbackListener::start(
            self.config.callback_port,
            &self.device_ip,
            &self.listener_busy,
            self.config.callback_timeout,
        )
        .await
        {
            Ok(handle) => {
                self.backoff = None;
                self.listener = Some(handle);
                self.set_status(AccountStatus::Linking);
            }
            Err(DeviceError::ListenerBusy) => {
                debug!("Previous callback listener still shutting down");
            }
            Err(e) => {
                warn!(error = %e, "Failed to start callback listener");
                self.backoff = Some(Backoff {
                    retry_at: now + jittered(self.config.min_backoff),
                    delay: self.config.min_backoff,
                });
            }
        }
    }

    async fn handle_linking(&mut self) {
        let finished = self.listener.as_ref().map(|l| l.is_finished()).unwrap_or(true);
        if !finished {
            return;
        }

        let result = match self.listener.take() {
            Some(handle) => handle.join().await,
            None => Ok(String::new()),
        };
        match result {
            Ok(code) if !code.is_empty() => {
                self.auth_code = Some(code);
                self.set_status(AccountStatus::Authenticating);
            }
            Ok(_) => {
                info!("No authorization code before timeout, re-arming listener");
                self.set_status(AccountStatus::NeedLink);
            }
            Err(e) => {
                error!(error = %e, "Callback listener failed");
                self.set_status(AccountStatus::Error);
            }
        }
    }

    async fn handle_authenticating(
        &mut self,
        now: Instant,
        store: &Store,
        system: &StateWriter<SystemState>,
    ) {
        let Some(code) = self.auth_code.take() else {
            self.set_status(AccountStatus::NeedLink);
            return;
        };

        let result = self.api.exchange_code(&code, &self.redirect_uri).await;
        let grant = match result {
            Ok(grant) if grant.refresh_token.is_some() => grant,
            Ok(_) => {
                error!("Code exchange returned no refresh token");
                self.set_status(AccountStatus::Error);
                return;
            }
            Err(e) => {
                error!(error = %e, "Code exchange failed");
                self.set_status(AccountStatus::Error);
                return;
            }
        };

        self.accept_grant(&grant, now, store);
        system.update(|s| s.account_linked = true);
        if let Err(e) = store.update_config(|c| c.account_linked = true) {
            error!(error = %e, "Failed to persist link flag");
        }
        info!("Account linked");
        self.enter_ready(now);
    }

    fn accept_grant(&mut self, grant: &TokenGrant, now: Instant, store: &Store) {
        self.access = Some(AccessToken::from_grant(grant, now));
        if let Some(rotated) = &grant.refresh_token {
            if let Err(e) = store.save_refresh_token(rotated) {
                error!(error = %e, "Failed to persist refresh token");
            }
            let rotated = rotated.clone();
            self.state.update(|s| s.refresh_token = rotated);
        }
    }

    fn enter_ready(&mut self, now: Instant) {
        self.next_poll = Some(now);
        self.published_art_url = PLACEHOLDER_ART_URL.to_string();
        self.background_pending = false;
        self.art_retry = None;
        let track = TrackInfo::sentinel();
        let epoch = self.publish_frame(None, track.clone(), None);
        self.state.update(|s| {
            s.track = track;
            s.art_epoch = epoch;
            s.text_epoch += 1;
        });
        self.set_status(AccountStatus::Ready);
    }

    /// Forget the link and go back to NEED_LINK, whatever the current status.
    pub fn relink(&mut self, store: &Store, system: &StateWriter<SystemState>) {
        info!("Re-link requested");
        self.stop_listener();
        if let Err(e) = store.reset_tokens() {
            error!(error = %e, "Failed to wipe stored token");
        }
        if let Err(e) = store.update_config(|c| c.account_linked = false) {
            error!(error = %e, "Failed to persist link flag");
        }
        system.update(|s| s.account_linked = false);

        self.access = None;
        self.auth_code = None;
        self.backoff = None;
        self.next_poll = None;
        self.art_retry = None;
        self.state.update(|s| {
            s.refresh_token.clear();
            s.status = AccountStatus::NeedLink;
        });
    }

    fn stop_listener(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }

    /// Raise both repaint markers, republishing the current frame.
    pub fn force_repaint(&mut self) {
        let snapshot = self.state.snapshot();
        let epoch = snapshot.art_epoch + 1;
        self.frames.update(|f| {
            f.epoch = epoch;
            f.track = snapshot.track.clone();
        });
        self.state.update(|s| {
            s.art_epoch = epoch;
            s.text_epoch += 1;
        });
    }

    // --- Polling ---

    async fn handle_ready(&mut self, now: Instant, store: &Store, system: &StateWriter<SystemState>) {
        if let Some(at) = self.next_poll {
            if now < at {
                return;
            }
        }
        let interval = match system.snapshot().activity {
            ActivityStatus::Active => self.config.poll_interval,
            ActivityStatus::Idle | ActivityStatus::Sleep => self.config.idle_poll_interval,
        };
        self.next_poll = Some(now + interval);

        match self.fetch_playback(now, store).await {
            Ok(playback) => self.apply_playback(now, playback).await,
            Err(e) if e.indicates_revoked_link() => {
                warn!(error = %e, "Account link revoked");
                self.access = None;
                self.set_status(AccountStatus::LinkError);
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Playback poll failed, keeping previous state")
            }
            Err(e) => error!(error = %e, "Unexpected playback response, keeping previous state"),
        }
    }

    async fn ensure_access(&mut self, now: Instant, store: &Store) -> Result<String, DeviceError> {
        if let Some(access) = &self.access {
            if access.is_valid(now) {
                return Ok(access.token.clone());
            }
        }
        trace!("Access token missing or stale");
        let refresh_token = self.state.snapshot().refresh_token;
        let grant = self.api.refresh(&refresh_token).await?;
        self.accept_grant(&grant, now, store);
        Ok(grant.access_token)
    }

    async fn fetch_playback(
        &mut self,
        now: Instant,
        store: &Store,
    ) -> Result<Option<Playback>, DeviceError> {
        let token = self.ensure_access(now, store).await?;
        let first = self.api.current_playback(&token).await;
        match first {
            Err(DeviceError::TokenExpired) => {
                debug!("Access token refused, refreshing");
                self.access = None;
                let token = self.ensure_access(now, store).await?;
                self.api.current_playback(&token).await
            }
            other => other,
        }
    }

    async fn apply_playback(&mut self, now: Instant, playback: Option<Playback>) {
        let current = self.state.snapshot().track;
        // A failing URL counts as published until its retry time comes round.
        let art_reference = match (&self.art_retry, playback.as_ref()) {
            (Some(retry), Some(p)) if retry.url == p.art_url && now < retry.backoff.retry_at => {
                retry.url.clone()
            }
            _ => self.published_art_url.clone(),
        };
        let outcome = classify(&current, &art_reference, playback.as_ref());
        trace!(?outcome, "Poll classified");

        match (outcome, playback) {
            (PollOutcome::NoChange, _) => {}
            (PollOutcome::Cleared, _) => {
                info!("Playback stopped, showing placeholder");
                self.published_art_url = PLACEHOLDER_ART_URL.to_string();
                self.background_pending = false;
                self.art_retry = None;
                let track = TrackInfo::sentinel();
                let epoch = self.publish_frame(None, track.clone(), None);
                self.state.update(|s| {
                    s.track = track;
                    s.art_epoch = epoch;
                    s.text_epoch += 1;
                });
            }
            (PollOutcome::Progress, Some(p)) => {
                self.state.update(|s| {
                    s.track.progress_ms = p.progress_ms;
                    s.track.duration_ms = p.duration_ms;
                    s.track.is_playing = p.is_playing;
                    s.track.device_name = p.device_name;
                });
            }
            (PollOutcome::TextOnly, Some(p)) => {
                info!(title = %p.title, artist = %p.artist, "Track changed");
                self.state.update(|s| {
                    s.track = p.to_track();
                    s.text_epoch += 1;
                });
            }
            (PollOutcome::ArtOnly, Some(p)) => {
                let with_background = self.background_pending;
                self.load_and_publish(now, p, with_background).await;
            }
            (PollOutcome::ArtAndBackground, Some(p)) => {
                info!(title = %p.title, artist = %p.artist, "Track changed");
                self.load_and_publish(now, p, true).await;
            }
            (outcome, None) => warn!(?outcome, "Outcome without playback"),
        }
    }

    async fn load_and_publish(&mut self, now: Instant, p: Playback, with_background: bool) {
        let track = p.to_track();

        if p.art_url == PLACEHOLDER_ART_URL {
            self.published_art_url = p.art_url.clone();
            self.background_pending = false;
            self.art_retry = None;
            let epoch = self.publish_frame(None, track.clone(), None);
            self.state.update(|s| {
                s.track = track;
                s.art_epoch = epoch;
            });
            return;
        }

        match self.art.load(&p.art_url, with_background).await {
            Ok(loaded) => {
                self.published_art_url = p.art_url.clone();
                self.background_pending = false;
                self.art_retry = None;
                let epoch = self.publish_frame(Some(loaded.image), track.clone(), loaded.background);
                self.state.update(|s| {
                    s.track = track;
                    if let Some(color) = loaded.background {
                        s.album_background_color = color;
                    }
                    s.art_epoch = epoch;
                });
            }
            Err(e) => {
                self.background_pending |= with_background;
                let delay = match &self.art_retry {
                    Some(retry) if retry.url == p.art_url => {
                        (retry.backoff.delay * 2).min(self.config.max_backoff)
                    }
                    _ => self.config.min_backoff,
                };
                let wait = jittered(delay);
                debug!(error = %e, wait_ms = wait.as_millis() as u64, "Art not published, retrying later");
                self.art_retry = Some(ArtRetry {
                    url: p.art_url.clone(),
                    backoff: Backoff {
                        retry_at: now + wait,
                        delay,
                    },
                });
                // Labels still follow the track; the art catches up later.
                let new_track = self.state.snapshot().track.id != track.id;
                self.state.update(|s| {
                    s.track = track;
                    if new_track {
                        s.text_epoch += 1;
                    }
                });
            }
        }
    }

    // Publish a frame one epoch ahead of the account state. Readers that see
    // the bumped `art_epoch` are guaranteed to find the matching frame.
    fn publish_frame(
        &self,
        image: Option<Arc<image::RgbImage>>,
        track: TrackInfo,
        background: Option<image::Rgb<u8>>,
    ) -> u64 {
        let current = self.state.snapshot();
        let epoch = current.art_epoch + 1;
        let background = background.unwrap_or(current.album_background_color);
        let url = track.art_url.clone();
        self.frames.update(|f| {
            f.epoch = epoch;
            f.url = url;
            f.image = image;
            f.background = background;
            f.track = track;
        });
        epoch
    }
}
