use serde::Deserialize;

use crate::state::{TrackInfo, PLACEHOLDER_ART_URL};

// Token endpoint response (authorization_code and refresh_token grants)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: u64,
    /// Only present when the service rotates the refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

// Token endpoint error body
#[derive(Debug, Clone, Deserialize)]
pub struct TokenError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Result of a successful exchange or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

impl From<TokenResponse> for TokenGrant {
    fn from(r: TokenResponse) -> Self {
        Self {
            access_token: r.access_token,
            refresh_token: r.refresh_token.filter(|t| !t.is_empty()),
            expires_in: r.expires_in,
        }
    }
}

// Player endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerResponse {
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub progress_ms: Option<u64>,
    #[serde(default)]
    pub device: Option<PlayerDevice>,
    #[serde(default)]
    pub item: Option<PlayerItem>,
    #[serde(default)]
    pub currently_playing_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerDevice {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub volume_percent: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerItem {
    /// Null for local files.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub album: Option<Album>,
    /// Episodes carry art on the item itself.
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artist {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Album {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// The slice of the player state the device cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playback {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub art_url: String,
    pub device_name: String,
    pub duration_ms: u64,
    pub progress_ms: u64,
    pub is_playing: bool,
}

impl Playback {
    /// `None` when the response has no playable item (ads, private session).
    pub fn from_player(response: &PlayerResponse) -> Option<Self> {
        let item = response.item.as_ref()?;
        let track_id = item
            .id
            .iter()
            .chain(item.uri.iter())
            .find(|id| !id.is_empty())?
            .clone();

        // Images are listed largest first.
        let art_url = item
            .album
            .as_ref()
            .and_then(|album| album.images.first())
            .or_else(|| item.images.first())
            .map(|image| image.url.clone())
            .unwrap_or_else(|| PLACEHOLDER_ART_URL.to_string());

        let artist = item
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        Some(Self {
            track_id,
            title: item.name.clone(),
            artist,
            art_url,
            device_name: response
                .device
                .as_ref()
                .map(|d| d.name.clone())
                .unwrap_or_default(),
            duration_ms: item.duration_ms,
            progress_ms: response.progress_ms.unwrap_or(0),
            is_playing: response.is_playing,
        })
    }

    pub fn to_track(&self) -> TrackInfo {
        TrackInfo {
            id: self.track_id.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            art_url: self.art_url.clone(),
            device_name: self.device_name.clone(),
            duration_ms: self.duration_ms,
            progress_ms: self.progress_ms,
            is_playing: self.is_playing,
        }
    }
}
