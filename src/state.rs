use image::{Rgb, RgbImage};
use std::sync::Arc;
use tokio::time::Instant;

/// Art URL carried by the sentinel track. Never fetched; the presenter draws
/// its built-in placeholder for it.
pub const PLACEHOLDER_ART_URL: &str = "placeholder://nothing-playing";

/// Background used before any album has been seen and when palette
/// extraction fails.
pub const FALLBACK_BACKGROUND: Rgb<u8> = Rgb([0x1E, 0x1E, 0x1E]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Idle,
    Scanning,
    ScanResults,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub status: NetworkStatus,
    pub connected: bool,
    pub ip: String,
    pub selected_ssid: String,
    pub selected_pass: String,
    /// Scan results, deduplicated, in discovery order.
    pub found_ssids: Vec<String>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            status: NetworkStatus::Idle,
            connected: false,
            ip: "0.0.0.0".to_string(),
            selected_ssid: String::new(),
            selected_pass: String::new(),
            found_ssids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Idle,
    Initializing,
    NeedLink,
    Linking,
    Authenticating,
    Ready,
    /// Previously linked, stored token no longer accepted.
    LinkError,
    /// Linking attempt failed.
    Error,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Idle => "IDLE",
            AccountStatus::Initializing => "INITIALIZING",
            AccountStatus::NeedLink => "NEED_LINK",
            AccountStatus::Linking => "LINKING",
            AccountStatus::Authenticating => "AUTHENTICATING",
            AccountStatus::Ready => "READY",
            AccountStatus::LinkError => "LINK_ERROR",
            AccountStatus::Error => "ERROR",
        }
    }
}

/// Current track as last observed by the account poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub artist: String,
    /// Album art URL.
    pub art_url: String,
    pub device_name: String,
    pub duration_ms: u64,
    pub progress_ms: u64,
    pub is_playing: bool,
}

impl TrackInfo {
    /// The synthetic "nothing playing" record.
    pub fn sentinel() -> Self {
        Self {
            id: String::new(),
            title: "Nothing Playing".to_string(),
            artist: "Waiting...".to_string(),
            art_url: PLACEHOLDER_ART_URL.to_string(),
            device_name: String::new(),
            duration_ms: 0,
            progress_ms: 0,
            is_playing: false,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id.is_empty()
    }
}

impl Default for TrackInfo {
    fn default() -> Self {
        Self::sentinel()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub status: AccountStatus,
    pub client_id: String,
    pub refresh_token: String,
    pub auth_url: String,
    pub track: TrackInfo,
    pub album_background_color: Rgb<u8>,
    /// Bumped whenever new art (with its text) is ready to be painted.
    pub art_epoch: u64,
    /// Bumped whenever only the track labels need repainting.
    pub text_epoch: u64,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            status: AccountStatus::Idle,
            client_id: String::new(),
            refresh_token: String::new(),
            auth_url: String::new(),
            track: TrackInfo::sentinel(),
            album_background_color: FALLBACK_BACKGROUND,
            art_epoch: 0,
            text_epoch: 0,
        }
    }
}

impl AccountState {
    /// `needs_art_update` as seen by a consumer that last applied `seen`.
    pub fn needs_art_update(&self, seen: u64) -> bool {
        self.art_epoch != seen
    }

    pub fn needs_text_update(&self, seen: u64) -> bool {
        self.text_epoch != seen
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Active,
    Idle,
    Sleep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemState {
    pub setup_complete: bool,
    pub account_linked: bool,
    pub activity: ActivityStatus,
    /// Only meaningful while IDLE; `None` until the first idle tick stamps it.
    pub time_first_idle: Option<Instant>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            setup_complete: false,
            account_linked: false,
            activity: ActivityStatus::Active,
            time_first_idle: None,
        }
    }
}

/// Decoded art plus the text it belongs to, published as one unit.
#[derive(Debug, Clone)]
pub struct ArtFrame {
    pub epoch: u64,
    pub url: String,
    /// `None` for the placeholder.
    pub image: Option<Arc<RgbImage>>,
    pub background: Rgb<u8>,
    pub track: TrackInfo,
}

impl Default for ArtFrame {
    fn default() -> Self {
        Self {
            epoch: 0,
            url: PLACEHOLDER_ART_URL.to_string(),
            image: None,
            background: FALLBACK_BACKGROUND,
            track: TrackInfo::sentinel(),
        }
    }
}
