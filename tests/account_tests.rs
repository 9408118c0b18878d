mod common;

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Duration, Instant};

use nowplaying_core::{
    classify, shared, AccountConfig, AccountManager, AccountState, AccountStatus, ArtFrame,
    ArtLoader, DeviceError, NetworkState, NetworkStatus, PollOutcome, StateReader, StateWriter,
    Store, SystemState, TrackInfo, PLACEHOLDER_ART_URL,
};

use common::{grant, paused_track, playback, scratch_dir, FakeApi, FakeArt};

const GRACE: Duration = Duration::from_millis(1500);

struct Harness {
    account: AccountManager<FakeApi>,
    api: FakeApi,
    art: FakeArt,
    state: StateReader<AccountState>,
    frames: StateReader<ArtFrame>,
    store: Store,
    system: StateWriter<SystemState>,
    network: NetworkState,
    start: Instant,
}

fn harness(refresh_token: &str) -> Harness {
    let api = FakeApi::default();
    let art = FakeArt::default();
    let (state_tx, state) = shared(AccountState {
        client_id: "test-client".to_string(),
        refresh_token: refresh_token.to_string(),
        ..AccountState::default()
    });
    let (frames_tx, frames) = shared(ArtFrame::default());
    let config = AccountConfig {
        link_grace: GRACE,
        poll_interval: Duration::from_millis(2000),
        idle_poll_interval: Duration::from_millis(5000),
        callback_port: 0,
        callback_timeout: None,
        min_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(60),
    };
    let account = AccountManager::new(
        api.clone(),
        ArtLoader::new(Arc::new(art.clone())),
        config,
        state_tx,
        frames_tx,
    );
    let (system, _) = shared(SystemState::default());
    let network = NetworkState {
        status: NetworkStatus::Connected,
        connected: true,
        ip: "127.0.0.1".to_string(),
        ..NetworkState::default()
    };
    Harness {
        account,
        api,
        art,
        state,
        frames,
        store: Store::mount(scratch_dir()).unwrap(),
        system,
        network,
        start: Instant::now(),
    }
}

impl Harness {
    async fn tick(&mut self, at: Duration) {
        let now = self.start + at;
        self.account
            .update(now, &self.network, &self.store, &self.system)
            .await;
    }

    // Open the gate and run INITIALIZING to READY.
    async fn ready(&mut self) {
        self.tick(Duration::ZERO).await;
        self.tick(GRACE).await;
        self.tick(GRACE).await;
        assert_eq!(self.state.snapshot().status, AccountStatus::Ready);
    }
}

// --- classify ---

#[test]
fn test_classify_outcomes() {
    let current = paused_track();
    let art = current.art_url.clone();

    assert_eq!(
        classify(&TrackInfo::sentinel(), PLACEHOLDER_ART_URL, None),
        PollOutcome::NoChange
    );
    assert_eq!(classify(&current, &art, None), PollOutcome::Cleared);

    let same = playback("track-1", &art, 1_000, false);
    let mut same_track = current.clone();
    same_track.device_name = same.device_name.clone();
    same_track.duration_ms = same.duration_ms;
    assert_eq!(
        classify(&same_track, &art, Some(&same)),
        PollOutcome::NoChange
    );

    let moved = playback("track-1", &art, 5_000, true);
    assert_eq!(classify(&same_track, &art, Some(&moved)), PollOutcome::Progress);

    let new_art = playback("track-1", "https://img.test/b.jpg", 1_000, false);
    assert_eq!(classify(&current, &art, Some(&new_art)), PollOutcome::ArtOnly);

    let same_album = playback("track-2", &art, 0, true);
    assert_eq!(
        classify(&current, &art, Some(&same_album)),
        PollOutcome::TextOnly
    );

    let new_album = playback("track-3", "https://img.test/c.jpg", 0, true);
    assert_eq!(
        classify(&current, &art, Some(&new_album)),
        PollOutcome::ArtAndBackground
    );
}

#[test]
fn test_classify_retries_unpublished_art() {
    // Track already adopted, but its art never made it out
    let current = paused_track();
    let p = playback("track-1", &current.art_url, current.progress_ms, false);
    assert_eq!(
        classify(&current, PLACEHOLDER_ART_URL, Some(&p)),
        PollOutcome::ArtOnly
    );
}

// --- gate and link lifecycle ---

#[tokio::test]
async fn test_gate_waits_for_grace() {
    let mut h = harness("stored-token");

    h.tick(Duration::ZERO).await;
    h.tick(GRACE - Duration::from_millis(1)).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::Idle);
    assert_eq!(h.state.snapshot().auth_url, "");

    h.tick(GRACE).await;
    let state = h.state.snapshot();
    assert_eq!(state.status, AccountStatus::Initializing);
    assert!(state
        .auth_url
        .contains("redirect_uri=http://127.0.0.1:0/callback"));
    assert!(state.auth_url.ends_with("state=127.0.0.1"));
}

#[tokio::test]
async fn test_gate_closed_without_link() {
    let mut h = harness("stored-token");
    h.network.connected = false;

    h.tick(Duration::ZERO).await;
    h.tick(GRACE * 4).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::Idle);
    assert_eq!(h.api.script.lock().unwrap().refresh_calls, 0);
}

#[tokio::test]
async fn test_stored_token_reaches_ready() {
    let mut h = harness("stored-token");
    h.api.push_refresh(Ok(grant("access-1", Some("rotated"))));

    h.ready().await;

    let state = h.state.snapshot();
    assert_eq!(state.refresh_token, "rotated");
    assert!(state.track.is_sentinel());
    assert_eq!(h.store.load_refresh_token(), "rotated");

    // Entering READY publishes the placeholder frame
    let frame = h.frames.snapshot();
    assert_eq!(frame.epoch, state.art_epoch);
    assert!(frame.image.is_none());
    assert_eq!(frame.url, PLACEHOLDER_ART_URL);
}

#[tokio::test]
async fn test_revoked_token_is_link_error() {
    let mut h = harness("stale-token");
    h.api
        .push_refresh(Err(DeviceError::AuthRejected("invalid_grant".to_string())));

    h.tick(Duration::ZERO).await;
    h.tick(GRACE).await;
    h.tick(GRACE).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::LinkError);

    // Terminal until re-link
    h.tick(GRACE * 10).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::LinkError);
    assert_eq!(h.api.script.lock().unwrap().refresh_calls, 1);
}

#[tokio::test]
async fn test_transient_refresh_failure_backs_off() {
    let mut h = harness("stored-token");
    h.api
        .push_refresh(Err(DeviceError::Radio("link dropped".to_string())));
    h.api.push_refresh(Ok(grant("access-1", None)));

    h.tick(Duration::ZERO).await;
    h.tick(GRACE).await;
    h.tick(GRACE).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::Initializing);

    // Within the jittered backoff window (500ms -30%)
    h.tick(GRACE + Duration::from_millis(100)).await;
    assert_eq!(h.api.script.lock().unwrap().refresh_calls, 1);

    h.tick(GRACE + Duration::from_secs(1)).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::Ready);
    assert_eq!(h.api.script.lock().unwrap().refresh_calls, 2);
    // No rotation: the stored token is kept
    assert_eq!(h.state.snapshot().refresh_token, "stored-token");
}

#[tokio::test]
async fn test_full_link_flow() {
    let mut h = harness("");
    h.api.push_exchange(Ok(grant("access-1", Some("fresh-refresh"))));

    h.tick(Duration::ZERO).await;
    h.tick(GRACE).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::NeedLink);

    h.tick(GRACE).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::Linking);
    let port = h.account.listener_addr().unwrap().port();

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream
        .write_all(b"GET /callback?code=auth-code&state=127.0.0.1 HTTP/1.1\r\nHost: device\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));

    // The listener task may need a moment to wind down
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while h.state.snapshot().status == AccountStatus::Linking {
        assert!(std::time::Instant::now() < deadline, "listener never finished");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        h.tick(GRACE).await;
    }
    assert_eq!(h.state.snapshot().status, AccountStatus::Authenticating);

    h.tick(GRACE).await;
    let state = h.state.snapshot();
    assert_eq!(state.status, AccountStatus::Ready);
    assert_eq!(state.refresh_token, "fresh-refresh");
    assert_eq!(h.store.load_refresh_token(), "fresh-refresh");
    assert!(h.system.snapshot().account_linked);
    assert!(h.store.load_config().unwrap().account_linked);

    let calls = h.api.script.lock().unwrap().exchange_calls.clone();
    assert_eq!(
        calls,
        vec![(
            "auth-code".to_string(),
            "http://127.0.0.1:0/callback".to_string()
        )]
    );
}

#[tokio::test]
async fn test_failed_exchange_is_error() {
    let mut h = harness("");
    h.api
        .push_exchange(Err(DeviceError::AuthRejected("invalid_grant".to_string())));

    h.tick(Duration::ZERO).await;
    h.tick(GRACE).await;
    h.tick(GRACE).await;
    let port = h.account.listener_addr().unwrap().port();

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream
        .write_all(b"GET /callback?code=bad&state=127.0.0.1 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while h.state.snapshot().status != AccountStatus::Error {
        assert!(std::time::Instant::now() < deadline, "never reached ERROR");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        h.tick(GRACE).await;
    }
    assert_eq!(h.store.load_refresh_token(), "");
}

#[tokio::test]
async fn test_relink_from_ready() {
    let mut h = harness("stored-token");
    h.api.push_refresh(Ok(grant("access-1", Some("rotated"))));
    h.ready().await;
    h.system.update(|s| s.account_linked = true);

    h.account.relink(&h.store, &h.system);

    let state = h.state.snapshot();
    assert_eq!(state.status, AccountStatus::NeedLink);
    assert_eq!(state.refresh_token, "");
    assert_eq!(h.store.load_refresh_token(), "");
    assert!(!h.system.snapshot().account_linked);

    // Next tick starts a fresh listener
    h.tick(GRACE * 2).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::Linking);
}

#[tokio::test]
async fn test_relink_from_link_error() {
    let mut h = harness("stale-token");
    h.api
        .push_refresh(Err(DeviceError::AuthRejected("invalid_grant".to_string())));
    h.tick(Duration::ZERO).await;
    h.tick(GRACE).await;
    h.tick(GRACE).await;
    assert_eq!(h.state.snapshot().status, AccountStatus::LinkError);

    h.account.relink(&h.store, &h.system);
    assert_eq!(h.state.snapshot().status, AccountStatus::NeedLink);
}

// --- polling ---

#[tokio::test]
async fn test_poll_policy() {
    let mut h = harness("stored-token");
    h.api.push_refresh(Ok(grant("access-1", None)));
    h.ready().await;
    let base = h.state.snapshot();

    // New track, new album: art only, with background
    h.api.push_playback(Ok(Some(playback(
        "track-1",
        "https://img.test/a.jpg",
        1_000,
        true,
    ))));
    h.tick(GRACE).await;
    let s1 = h.state.snapshot();
    assert_eq!(s1.track.id, "track-1");
    assert_eq!(s1.art_epoch, base.art_epoch + 1);
    assert_eq!(s1.text_epoch, base.text_epoch);
    assert_ne!(s1.album_background_color, base.album_background_color);
    let frame = h.frames.snapshot();
    assert_eq!(frame.epoch, s1.art_epoch);
    assert_eq!(frame.url, "https://img.test/a.jpg");
    assert!(frame.image.is_some());

    // Before the poll interval nothing is fetched
    h.tick(GRACE + Duration::from_millis(1999)).await;
    assert_eq!(h.api.script.lock().unwrap().playback_tokens.len(), 1);

    // Progress only
    h.api.push_playback(Ok(Some(playback(
        "track-1",
        "https://img.test/a.jpg",
        3_000,
        true,
    ))));
    h.tick(GRACE + Duration::from_millis(2000)).await;
    let s2 = h.state.snapshot();
    assert_eq!(s2.track.progress_ms, 3_000);
    assert_eq!((s2.art_epoch, s2.text_epoch), (s1.art_epoch, s1.text_epoch));

    // Next track on the same album: text only
    h.api.push_playback(Ok(Some(playback(
        "track-2",
        "https://img.test/a.jpg",
        0,
        true,
    ))));
    h.tick(GRACE + Duration::from_millis(4000)).await;
    let s3 = h.state.snapshot();
    assert_eq!(s3.track.id, "track-2");
    assert_eq!(s3.art_epoch, s2.art_epoch);
    assert_eq!(s3.text_epoch, s2.text_epoch + 1);

    // Nothing playing: back to the sentinel, both markers
    h.api.push_playback(Ok(None));
    h.tick(GRACE + Duration::from_millis(6000)).await;
    let s4 = h.state.snapshot();
    assert!(s4.track.is_sentinel());
    assert_eq!(s4.art_epoch, s3.art_epoch + 1);
    assert_eq!(s4.text_epoch, s3.text_epoch + 1);
    assert!(h.frames.snapshot().image.is_none());

    // Still nothing: no change
    h.api.push_playback(Ok(None));
    h.tick(GRACE + Duration::from_millis(8000)).await;
    assert_eq!(h.state.snapshot(), s4);

    assert_eq!(
        h.art.script.lock().unwrap().fetched,
        vec!["https://img.test/a.jpg".to_string()]
    );
}

#[tokio::test]
async fn test_art_failure_keeps_published_art() {
    let mut h = harness("stored-token");
    h.api.push_refresh(Ok(grant("access-1", None)));
    h.ready().await;
    let base = h.state.snapshot();
    let base_frame = h.frames.snapshot();

    h.art.script.lock().unwrap().failing = true;
    let p = playback("track-1", "https://img.test/a.jpg", 0, true);
    h.api.push_playback(Ok(Some(p.clone())));
    h.tick(GRACE).await;

    let s1 = h.state.snapshot();
    assert_eq!(s1.art_epoch, base.art_epoch);
    assert_eq!(s1.text_epoch, base.text_epoch + 1);
    assert_eq!(s1.track.id, "track-1");
    assert_eq!(h.frames.snapshot().epoch, base_frame.epoch);

    // Retried on the next poll
    h.art.script.lock().unwrap().failing = false;
    h.api.push_playback(Ok(Some(p)));
    h.tick(GRACE + Duration::from_millis(2000)).await;
    let s2 = h.state.snapshot();
    assert_eq!(s2.art_epoch, base.art_epoch + 1);
    assert_eq!(h.art.script.lock().unwrap().fetched.len(), 2);
}

#[tokio::test]
async fn test_failing_art_backs_off_between_polls() {
    let mut h = harness("stored-token");
    h.api.push_refresh(Ok(grant("access-1", None)));
    h.ready().await;
    let base = h.state.snapshot();

    h.art.script.lock().unwrap().failing = true;
    let p = playback("track-1", "https://img.test/broken.jpg", 0, true);
    for i in 0..10u64 {
        h.api.push_playback(Ok(Some(p.clone())));
        h.tick(GRACE + Duration::from_millis(2000 * i)).await;
    }

    // Every poll ran, but the download was only retried as the delay doubled
    assert_eq!(h.api.script.lock().unwrap().playback_tokens.len(), 10);
    let fetched = h.art.script.lock().unwrap().fetched.len();
    assert!((3..=6).contains(&fetched), "fetched {} times", fetched);

    let s = h.state.snapshot();
    assert_eq!(s.art_epoch, base.art_epoch);
    assert_eq!(s.text_epoch, base.text_epoch + 1);
    assert_eq!(s.track.id, "track-1");
}

#[tokio::test]
async fn test_expired_access_token_refreshes_once() {
    let mut h = harness("stored-token");
    h.api.push_refresh(Ok(grant("access-1", None)));
    h.ready().await;

    h.api.push_playback(Err(DeviceError::TokenExpired));
    h.api.push_refresh(Ok(grant("access-2", None)));
    h.api.push_playback(Ok(Some(playback(
        "track-1",
        PLACEHOLDER_ART_URL,
        0,
        true,
    ))));
    h.tick(GRACE).await;

    let script = h.api.script.lock().unwrap();
    assert_eq!(script.playback_tokens, vec!["access-1", "access-2"]);
    assert_eq!(script.refresh_calls, 2);
    drop(script);
    assert_eq!(h.state.snapshot().track.id, "track-1");
    assert_eq!(h.state.snapshot().status, AccountStatus::Ready);
}

#[tokio::test]
async fn test_poll_transport_failure_keeps_state() {
    let mut h = harness("stored-token");
    h.api.push_refresh(Ok(grant("access-1", None)));
    h.ready().await;

    h.api.push_playback(Ok(Some(playback(
        "track-1",
        PLACEHOLDER_ART_URL,
        0,
        true,
    ))));
    h.tick(GRACE).await;
    let before = h.state.snapshot();

    h.api
        .push_playback(Err(DeviceError::Radio("timeout".to_string())));
    h.tick(GRACE + Duration::from_millis(2000)).await;

    assert_eq!(h.state.snapshot(), before);
}

#[tokio::test]
async fn test_force_repaint_bumps_both_markers() {
    let mut h = harness("stored-token");
    h.api.push_refresh(Ok(grant("access-1", None)));
    h.ready().await;
    let before = h.state.snapshot();

    h.account.force_repaint();

    let after = h.state.snapshot();
    assert_eq!(after.art_epoch, before.art_epoch + 1);
    assert_eq!(after.text_epoch, before.text_epoch + 1);
    assert_eq!(h.frames.snapshot().epoch, after.art_epoch);
}
