//! One-shot HTTP listener for the authorization redirect.
//!
//! The phone that scanned the link QR code is sent back to
//! `http://<device ip>:<port>/callback?code=..&state=..`. The listener
//! answers every request with a small HTML page and resolves with the first
//! code whose `state` matches, then closes the socket.

use futures::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use crate::DeviceError;

const MAX_REQUEST_LINE: usize = 8 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    static ref CALLBACK_LINE: Regex =
        Regex::new(r"^GET\s+/callback\?(\S*)\s+HTTP/1\.[01]$").unwrap();
}

/// Query parameters of the redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Parse an HTTP request line. `None` for anything but `GET /callback?...`.
pub fn parse_callback(request_line: &str) -> Option<CallbackQuery> {
    let caps = CALLBACK_LINE.captures(request_line.trim_end())?;
    serde_urlencoded::from_str(caps.get(1)?.as_str()).ok()
}

/// Clears the busy flag however the listener task ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CallbackListener;

impl CallbackListener {
    /// Bind `port` and start waiting for the redirect in a background task.
    ///
    /// `busy` is shared between attempts; a second start while one listener
    /// is alive fails with [`DeviceError::ListenerBusy`]. With `timeout` set
    /// the handle resolves to an empty code once it elapses.
    pub async fn start(
        port: u16,
        expected_state: &str,
        busy: &Arc<AtomicBool>,
        timeout: Option<Duration>,
    ) -> Result<ListenerHandle, DeviceError> {
        if busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeviceError::ListenerBusy);
        }
        let guard = BusyGuard(Arc::clone(busy));

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Callback listener started");

        let expected = expected_state.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let serve = accept_until_code(listener, expected);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, serve).await {
                    Ok(code) => code,
                    Err(_) => {
                        warn!(?limit, "Callback listener timed out");
                        String::new()
                    }
                },
                None => serve.await,
            }
        });

        Ok(ListenerHandle { task, local_addr })
    }
}

async fn accept_until_code(listener: TcpListener, expected_state: String) -> String {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Callback accept failed");
                continue;
            }
        };
        debug!(%peer, "Callback connection");
        if let Some(code) = serve_connection(stream, &expected_state).await {
            info!("Authorization code received");
            return code;
        }
    }
}

async fn serve_connection(mut stream: TcpStream, expected_state: &str) -> Option<String> {
    let (reader, _) = stream.split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));
    let request_line = match tokio::time::timeout(READ_TIMEOUT, lines.next()).await {
        Ok(Some(Ok(line))) => line,
        Ok(Some(Err(e))) => {
            debug!(error = %e, "Unreadable request line");
            return None;
        }
        _ => return None,
    };
    // Consume the headers so closing the socket doesn't reset the connection.
    while let Ok(Some(Ok(line))) = tokio::time::timeout(READ_TIMEOUT, lines.next()).await {
        if line.is_empty() {
            break;
        }
    }
    drop(lines);

    let (status, body, code) = match parse_callback(&request_line) {
        Some(CallbackQuery {
            error: Some(error), ..
        }) => {
            warn!(%error, "Authorization denied by user");
            ("200 OK", page("Linking was cancelled. Try again from the device."), None)
        }
        Some(CallbackQuery {
            code: Some(code),
            state,
            ..
        }) if !code.is_empty() => {
            if state.as_deref() == Some(expected_state) {
                ("200 OK", page("Linked! You can close this window."), Some(code))
            } else {
                warn!(?state, "Callback state mismatch");
                ("400 Bad Request", page("This link has expired."), None)
            }
        }
        Some(_) => ("400 Bad Request", page("Missing authorization code."), None),
        None => ("404 Not Found", page("Not found."), None),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "Failed to answer callback request");
    }
    let _ = stream.shutdown().await;
    code
}

fn page(message: &str) -> String {
    format!(
        "<!DOCTYPE html><html><body style=\"font-family:sans-serif;text-align:center\"><h2>{}</h2></body></html>",
        message
    )
}

/// Running listener. Dropping the handle leaves the task running; call
/// [`abort`](Self::abort) to free the port early.
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<String>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the code. Empty on timeout.
    pub async fn join(self) -> Result<String, DeviceError> {
        Ok(self.task.await?)
    }
}
