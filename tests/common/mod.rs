// Hand-written fakes for the hardware and remote-service seams.
#![allow(dead_code)]

use futures::future::BoxFuture;
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nowplaying_core::{
    AccountApi, ArtSource, Backlight, DeviceError, LinkStatus, NowPlayingFrame, Playback,
    Presenter, Radio, TokenGrant, TrackInfo, PLACEHOLDER_ART_URL,
};

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("nowplaying-test-{}", uuid::Uuid::new_v4()))
}

pub fn write_secrets(dir: &std::path::Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("secrets.json"),
        r#"{"client_id":"test-client","client_secret":"test-secret"}"#,
    )
    .unwrap();
}

// --- Radio ---

#[derive(Debug, Default)]
pub struct RadioScript {
    pub scan_result: Vec<String>,
    pub scan_fails: bool,
    pub link: Option<LinkStatus>,
    pub begin_fails: bool,
    pub begins: Vec<(String, String)>,
    pub disconnects: Vec<bool>,
    pub scans: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeRadio {
    pub script: Arc<Mutex<RadioScript>>,
}

impl FakeRadio {
    pub fn set_link(&self, link: LinkStatus) {
        self.script.lock().unwrap().link = Some(link);
    }

    pub fn set_scan(&self, names: &[&str]) {
        self.script.lock().unwrap().scan_result = names.iter().map(|s| s.to_string()).collect();
    }
}

impl Radio for FakeRadio {
    fn scan(&mut self) -> BoxFuture<'_, Result<Vec<String>, DeviceError>> {
        let result = {
            let mut script = self.script.lock().unwrap();
            script.scans += 1;
            if script.scan_fails {
                Err(DeviceError::Radio("scan failed".to_string()))
            } else {
                Ok(script.scan_result.clone())
            }
        };
        Box::pin(async move { result })
    }

    fn begin(&mut self, ssid: &str, password: &str) -> Result<(), DeviceError> {
        let mut script = self.script.lock().unwrap();
        script.begins.push((ssid.to_string(), password.to_string()));
        if script.begin_fails {
            return Err(DeviceError::Radio("refused".to_string()));
        }
        script.link = Some(LinkStatus::Associating);
        Ok(())
    }

    fn disconnect(&mut self, erase: bool) {
        let mut script = self.script.lock().unwrap();
        script.disconnects.push(erase);
        script.link = Some(LinkStatus::Idle);
    }

    fn link(&mut self) -> LinkStatus {
        self.script
            .lock()
            .unwrap()
            .link
            .clone()
            .unwrap_or(LinkStatus::Idle)
    }
}

// --- Account API ---

#[derive(Debug, Default)]
pub struct ApiScript {
    pub refresh: VecDeque<Result<TokenGrant, DeviceError>>,
    pub exchange: VecDeque<Result<TokenGrant, DeviceError>>,
    pub playback: VecDeque<Result<Option<Playback>, DeviceError>>,
    pub refresh_calls: usize,
    pub exchange_calls: Vec<(String, String)>,
    pub playback_tokens: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeApi {
    pub script: Arc<Mutex<ApiScript>>,
}

pub fn grant(access: &str, refresh: Option<&str>) -> TokenGrant {
    TokenGrant {
        access_token: access.to_string(),
        refresh_token: refresh.map(|s| s.to_string()),
        expires_in: 3600,
    }
}

impl FakeApi {
    pub fn push_refresh(&self, result: Result<TokenGrant, DeviceError>) {
        self.script.lock().unwrap().refresh.push_back(result);
    }

    pub fn push_exchange(&self, result: Result<TokenGrant, DeviceError>) {
        self.script.lock().unwrap().exchange.push_back(result);
    }

    pub fn push_playback(&self, result: Result<Option<Playback>, DeviceError>) {
        self.script.lock().unwrap().playback.push_back(result);
    }
}

impl AccountApi for FakeApi {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<String, DeviceError> {
        Ok(format!(
            "https://accounts.test/authorize?redirect_uri={}&state={}",
            redirect_uri, state
        ))
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, DeviceError>> {
        let result = {
            let mut script = self.script.lock().unwrap();
            script
                .exchange_calls
                .push((code.to_string(), redirect_uri.to_string()));
            script
                .exchange
                .pop_front()
                .unwrap_or_else(|| Err(DeviceError::AuthRejected("unscripted".to_string())))
        };
        Box::pin(async move { result })
    }

    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, DeviceError>> {
        let result = {
            let mut script = self.script.lock().unwrap();
            script.refresh_calls += 1;
            script
                .refresh
                .pop_front()
                .unwrap_or_else(|| Ok(grant("access-default", None)))
        };
        Box::pin(async move { result })
    }

    fn current_playback<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, Result<Option<Playback>, DeviceError>> {
        let result = {
            let mut script = self.script.lock().unwrap();
            script.playback_tokens.push(access_token.to_string());
            script.playback.pop_front().unwrap_or(Ok(None))
        };
        Box::pin(async move { result })
    }
}

pub fn playback(id: &str, art_url: &str, progress_ms: u64, is_playing: bool) -> Playback {
    Playback {
        track_id: id.to_string(),
        title: format!("Title {}", id),
        artist: "Artist".to_string(),
        art_url: art_url.to_string(),
        device_name: "Kitchen".to_string(),
        duration_ms: 200_000,
        progress_ms,
        is_playing,
    }
}

pub fn paused_track() -> TrackInfo {
    TrackInfo {
        id: "track-1".to_string(),
        title: "Song".to_string(),
        artist: "Band".to_string(),
        art_url: "https://img.test/a.jpg".to_string(),
        device_name: "Kitchen".to_string(),
        duration_ms: 200_000,
        progress_ms: 1_000,
        is_playing: false,
    }
}

pub fn placeholder_url() -> String {
    PLACEHOLDER_ART_URL.to_string()
}

// --- Art ---

pub fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

#[derive(Debug, Default)]
pub struct ArtScript {
    pub failing: bool,
    pub fetched: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeArt {
    pub script: Arc<Mutex<ArtScript>>,
}

impl ArtSource for FakeArt {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, DeviceError>> {
        let result = {
            let mut script = self.script.lock().unwrap();
            script.fetched.push(url.to_string());
            if script.failing {
                Err(DeviceError::IncompleteDownload {
                    expected: 100,
                    received: 40,
                })
            } else {
                Ok(png_bytes(4, 4, [200, 40, 40]))
            }
        };
        Box::pin(async move { result })
    }
}

// --- Backlight ---

#[derive(Debug, Clone, Default)]
pub struct FakeBacklight {
    pub levels: Arc<Mutex<Vec<u8>>>,
}

impl Backlight for FakeBacklight {
    fn set_brightness(&mut self, level: u8) {
        self.levels.lock().unwrap().push(level);
    }
}

// --- Presenter ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Onboarding,
    Spinner(String),
    NetworkList(Vec<String>),
    WifiError(String),
    Context(String),
    Link(String),
    LinkError,
    AccountError,
    Player,
    Sleep,
    Failure(String),
    NowPlaying { title: String, placeholder: bool },
    TrackText(String),
    Progress(u64, u64),
}

#[derive(Debug, Default)]
pub struct RecordingPresenter {
    pub calls: Vec<Screen>,
}

impl RecordingPresenter {
    pub fn screens(&self) -> Vec<Screen> {
        self.calls
            .iter()
            .filter(|c| !matches!(c, Screen::Progress(..)))
            .cloned()
            .collect()
    }
}

impl Presenter for RecordingPresenter {
    fn show_onboarding(&mut self) {
        self.calls.push(Screen::Onboarding);
    }
    fn show_spinner(&mut self, message: &str) {
        self.calls.push(Screen::Spinner(message.to_string()));
    }
    fn show_network_list(&mut self, ssids: &[String]) {
        self.calls.push(Screen::NetworkList(ssids.to_vec()));
    }
    fn show_wifi_error(&mut self, ssid: &str) {
        self.calls.push(Screen::WifiError(ssid.to_string()));
    }
    fn show_context(&mut self, message: &str) {
        self.calls.push(Screen::Context(message.to_string()));
    }
    fn show_link(&mut self, auth_url: &str) {
        self.calls.push(Screen::Link(auth_url.to_string()));
    }
    fn show_link_error(&mut self) {
        self.calls.push(Screen::LinkError);
    }
    fn show_account_error(&mut self) {
        self.calls.push(Screen::AccountError);
    }
    fn show_player(&mut self) {
        self.calls.push(Screen::Player);
    }
    fn show_sleep(&mut self) {
        self.calls.push(Screen::Sleep);
    }
    fn show_failure(&mut self, message: &str) {
        self.calls.push(Screen::Failure(message.to_string()));
    }
    fn apply_now_playing(&mut self, frame: &NowPlayingFrame<'_>) {
        self.calls.push(Screen::NowPlaying {
            title: frame.track.title.clone(),
            placeholder: frame.is_placeholder(),
        });
    }
    fn update_track_text(&mut self, track: &TrackInfo) {
        self.calls.push(Screen::TrackText(track.title.clone()));
    }
    fn set_track_progress(&mut self, progress_ms: u64, duration_ms: u64) {
        self.calls.push(Screen::Progress(progress_ms, duration_ms));
    }
}
