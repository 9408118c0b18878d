mod account;
pub use account::{classify, AccountConfig, AccountManager, PollOutcome};
mod art;
pub use art::{
    background_color, collect_body, decode_art, rgb565, ArtLoader, ArtSource, HttpArtSource,
    LoadedArt, Rescaler,
};
mod commands;
pub use commands::{command_channel, Command, CommandKind, CommandReceiver, CommandSender};
mod error;
pub use error::DeviceError;
mod listener;
pub use listener::{parse_callback, CallbackListener, CallbackQuery, ListenerHandle};
mod models;
pub use models::{
    Album, Artist, ImageRef, Playback, PlayerDevice, PlayerItem, PlayerResponse, TokenError,
    TokenGrant, TokenResponse,
};
mod network;
pub use network::{dedup_ssids, LinkStatus, NetworkManager, Radio};
mod power;
pub use power::{Backlight, PowerPolicy, PowerTransition, BACKLIGHT_OFF, BACKLIGHT_ON};
mod render;
pub use render::{present_failure, NowPlayingFrame, Presenter, RenderContext};
mod service;
pub use service::{boot, Boot, DeviceHandles, ServiceLoop, ShutdownHandle};
mod settings;
pub use settings::{Settings, SETTINGS};
mod shared;
pub use shared::{shared, StateReader, StateWriter};
mod state;
pub use state::{
    AccountState, AccountStatus, ActivityStatus, ArtFrame, NetworkState, NetworkStatus,
    SystemState, TrackInfo, FALLBACK_BACKGROUND, PLACEHOLDER_ART_URL,
};
mod storage;
pub use storage::{DeviceConfig, Secrets, Store};
mod web_api;
pub use web_api::{AccountApi, WebApi, SCOPES};

use std::sync::Arc;
use tracing::{error, info};

/// Boot the device and start the service loop on its own thread.
///
/// Returns the render context for the caller to drive on its runtime, plus
/// the service thread handle. On a fatal boot error the failure screen is
/// shown and the error returned.
///
/// # Logging
///
/// This library uses the `tracing` crate for logging. To enable logs, you'll need to
/// initialize a tracing subscriber in your application.
///
/// Example using `tracing_subscriber`:
/// ```no_run
/// use tracing::Level;
/// use tracing_subscriber::FmtSubscriber;
///
/// // Create a subscriber with the desired log level
/// let subscriber = FmtSubscriber::builder()
///     .with_max_level(Level::DEBUG) // Set to DEBUG, INFO, WARN, or ERROR
///     .finish();
///
/// // Initialize the global subscriber
/// tracing::subscriber::set_global_default(subscriber)
///     .expect("Failed to set tracing subscriber");
/// ```
///
/// The log levels control what information is displayed:
/// - `TRACE`: Per-tick detail such as poll classification and rescale jobs
/// - `DEBUG`: Screen dispatch, downloads, coalesced commands
/// - `INFO`: Status transitions, link and account events
/// - `WARN`: Transient failures that are retried or held
/// - `ERROR`: Failures that need the user (re-link, reset) or a restart
pub fn start<R, B, P>(
    settings: &Settings,
    radio: R,
    backlight: B,
    mut presenter: P,
) -> Result<(RenderContext<P>, std::thread::JoinHandle<()>), DeviceError>
where
    R: Radio + 'static,
    B: Backlight + 'static,
    P: Presenter,
{
    let booted = match boot(settings) {
        Ok(booted) => booted,
        Err(e) => {
            present_failure(&mut presenter, &e);
            return Err(e);
        }
    };

    let api = WebApi::new(
        booted.secrets.clone(),
        &settings.accounts_url,
        &settings.api_url,
        settings.request_timeout,
    )?;
    let art: Arc<dyn ArtSource> = Arc::new(HttpArtSource::new(
        settings.art_stall_timeout,
        settings.art_max_bytes,
    )?);

    let (service, handles) = ServiceLoop::new(settings, booted, radio, api, art, backlight);
    let thread = service.spawn_pinned().map_err(|e| {
        error!(error = %e, "Failed to spawn service thread");
        DeviceError::from(e)
    })?;
    info!("Device started");

    Ok((RenderContext::new(presenter, handles, settings), thread))
}
