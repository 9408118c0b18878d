use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::shared::StateWriter;
use crate::state::{ActivityStatus, SystemState, TrackInfo};

pub const BACKLIGHT_ON: u8 = 255;
pub const BACKLIGHT_OFF: u8 = 0;

/// Panel backlight. Implemented by the board support layer.
pub trait Backlight: Send {
    fn set_brightness(&mut self, level: u8);
}

/// Activity change made by a [`PowerPolicy::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTransition {
    Idled,
    Slept,
    /// Playback resumed from IDLE or SLEEP. Both repaint markers must be raised.
    Woke,
}

/// ACTIVE / IDLE / SLEEP policy driven by the current track.
pub struct PowerPolicy<B: Backlight> {
    backlight: B,
    sleep_timeout: Duration,
    pause_sleep_timeout: Duration,
    active_tick: Duration,
    idle_tick: Duration,
}

impl<B: Backlight> PowerPolicy<B> {
    pub fn new(
        backlight: B,
        sleep_timeout: Duration,
        pause_sleep_timeout: Duration,
        active_tick: Duration,
        idle_tick: Duration,
    ) -> Self {
        Self {
            backlight,
            sleep_timeout,
            pause_sleep_timeout,
            active_tick,
            idle_tick,
        }
    }

    /// Pin the device ACTIVE while there is no now-playing screen to
    /// sleep over (link, error and spinner screens). `Some(Woke)` when it
    /// was IDLE or SLEEP.
    pub fn hold_active(&mut self, system: &StateWriter<SystemState>) -> Option<PowerTransition> {
        let activity = system.snapshot().activity;
        if activity == ActivityStatus::Active {
            return None;
        }
        debug!(from = ?activity, "Leaving now-playing, forcing active");
        if activity == ActivityStatus::Sleep {
            self.backlight.set_brightness(BACKLIGHT_ON);
        }
        system.update(|s| {
            s.activity = ActivityStatus::Active;
            s.time_first_idle = None;
        });
        Some(PowerTransition::Woke)
    }

    /// Service-loop cadence for the given activity.
    pub fn tick_interval(&self, activity: ActivityStatus) -> Duration {
        match activity {
            ActivityStatus::Active => self.active_tick,
            ActivityStatus::Idle | ActivityStatus::Sleep => self.idle_tick,
        }
    }

    /// Idle time allowed before sleeping: the sentinel sleeps sooner than a
    /// paused track.
    pub fn sleep_threshold(&self, track: &TrackInfo) -> Duration {
        if track.is_sentinel() {
            self.sleep_timeout
        } else {
            self.pause_sleep_timeout
        }
    }

    pub fn tick(
        &mut self,
        now: Instant,
        track: &TrackInfo,
        system: &StateWriter<SystemState>,
    ) -> Option<PowerTransition> {
        let current = system.snapshot();

        if track.is_playing {
            if current.activity == ActivityStatus::Active {
                return None;
            }
            info!(from = ?current.activity, "Playback resumed, waking");
            self.backlight.set_brightness(BACKLIGHT_ON);
            system.update(|s| {
                s.activity = ActivityStatus::Active;
                s.time_first_idle = None;
            });
            return Some(PowerTransition::Woke);
        }

        match current.activity {
            ActivityStatus::Active => {
                info!("Playback stopped, going idle");
                system.update(|s| {
                    s.activity = ActivityStatus::Idle;
                    s.time_first_idle = None;
                });
                Some(PowerTransition::Idled)
            }
            ActivityStatus::Idle => {
                let Some(since) = current.time_first_idle else {
                    system.update(|s| s.time_first_idle = Some(now));
                    return None;
                };
                let elapsed = now.saturating_duration_since(since);
                let threshold = self.sleep_threshold(track);
                if elapsed < threshold {
                    debug!(elapsed_ms = elapsed.as_millis() as u64, "Idle");
                    return None;
                }
                info!(
                    elapsed_s = elapsed.as_secs(),
                    sentinel = track.is_sentinel(),
                    "Idle timeout reached, sleeping"
                );
                self.backlight.set_brightness(BACKLIGHT_OFF);
                system.update(|s| s.activity = ActivityStatus::Sleep);
                Some(PowerTransition::Slept)
            }
            ActivityStatus::Sleep => None,
        }
    }
}
