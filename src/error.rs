use thiserror::Error;

// Basic error handling with thiserror
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    ParseFailed(#[from] serde_json::Error),

    #[error("URL encoding failed: {0}")]
    UrlEncodingFailed(#[from] serde_urlencoded::ser::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image decoding failed: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("Access token expired (HTTP 401)")]
    TokenExpired, // The API answered 401 for the current access token

    #[error("Authorization rejected: {0}")]
    AuthRejected(String), // Revoked refresh token, bad code, bad client credentials

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Secrets document missing or unreadable")]
    SecretsMissing,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Download incomplete: expected {expected} bytes, received {received}")]
    IncompleteDownload { expected: usize, received: usize },

    #[error("Download stalled for longer than {0:?}")]
    DownloadStalled(std::time::Duration),

    #[error("Response did not declare a content length")]
    MissingContentLength,

    #[error("Art of {declared} bytes exceeds the {limit} byte limit")]
    ArtTooLarge { declared: usize, limit: usize },

    #[error("Callback listener already running")]
    ListenerBusy,

    #[error("Radio error: {0}")]
    Radio(String),

    #[error("Task panicked or cancelled")]
    TaskJoinError(#[from] tokio::task::JoinError),
}

impl DeviceError {
    /// Whether the failure is worth retrying without user action.
    ///
    /// Rejections from the account service and missing documents are
    /// persistent; anything that looks like a flaky link is transient.
    pub fn is_transient(&self) -> bool {
        match self {
            DeviceError::RequestFailed(e) => !e.is_status(),
            DeviceError::IoError(_)
            | DeviceError::DownloadStalled(_)
            | DeviceError::IncompleteDownload { .. }
            | DeviceError::Radio(_)
            | DeviceError::TaskJoinError(_) => true,
            _ => false,
        }
    }

    /// Errors after which the stored account link can no longer be trusted.
    pub fn indicates_revoked_link(&self) -> bool {
        matches!(
            self,
            DeviceError::AuthRejected(_) | DeviceError::TokenExpired
        )
    }
}
