//! Sliding-window admission control, per caller and global.
//!
//! Each window is a deque of admission instants in ascending order. Expired
//! instants are purged from the front lazily on every check, so the cost of a
//! check is proportional to the number of admissions that just expired.
//!
//! A caller's window and the global window are checked and updated while both
//! locks are held (caller entry first, then global). Concurrent callers can
//! therefore never push either window past its limit, and a request denied by
//! one window leaves no trace in the other.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Which window denied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Caller,
    Global,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Caller => write!(f, "caller"),
            LimitScope::Global => write!(f, "global"),
        }
    }
}

/// A request was refused admission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Rate limit exceeded ({scope} limit of {limit} per {}s) for caller '{caller}', retry after {}ms",
    .window.as_secs(),
    .retry_after.as_millis()
)]
pub struct RateLimitDenied {
    pub scope: LimitScope,
    pub caller: String,
    pub limit: u32,
    pub window: Duration,
    /// Time until the oldest admission in the tripped window expires.
    pub retry_after: Duration,
}

/// Current occupancy of a caller's window and the global window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub caller_count: u32,
    pub caller_remaining: u32,
    pub global_count: u32,
    pub global_remaining: u32,
}

/// Drop admissions that are at least `window` old.
fn purge(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= length {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn retry_after(window: &VecDeque<Instant>, now: Instant, length: Duration) -> Duration {
    window
        .front()
        .map(|oldest| (*oldest + length).saturating_duration_since(now))
        .unwrap_or(Duration::ZERO)
}

/// Per-caller and global sliding-window limiter.
pub struct RateLimiter {
    per_caller_limit: u32,
    global_limit: u32,
    window: Duration,
    enabled: bool,
    callers: DashMap<String, VecDeque<Instant>>,
    global: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(per_caller_limit: u32, global_limit: u32, window: Duration) -> Self {
        Self {
            per_caller_limit,
            global_limit,
            window,
            enabled: true,
            callers: DashMap::new(),
            global: Mutex::new(VecDeque::new()),
        }
    }

    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(u32::MAX, u32::MAX, Duration::from_secs(60))
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one request for `caller`, or report which window is full.
    pub fn try_acquire(&self, caller: &str) -> Result<(), RateLimitDenied> {
        if !self.enabled {
            return Ok(());
        }

        let mut caller_window = self.callers.entry(caller.to_string()).or_default();
        let now = Instant::now();

        purge(&mut caller_window, now, self.window);
        if caller_window.len() >= self.per_caller_limit as usize {
            return Err(self.denied(LimitScope::Caller, caller, &caller_window, now));
        }

        let mut global = self.global.lock();
        purge(&mut global, now, self.window);
        if global.len() >= self.global_limit as usize {
            return Err(self.denied(LimitScope::Global, caller, &global, now));
        }

        // Keep both deques ordered even if another task read `now` later but
        // reached the global lock first.
        let stamp = global.back().map_or(now, |last| now.max(*last));
        global.push_back(stamp);
        caller_window.push_back(stamp);
        Ok(())
    }

    fn denied(
        &self,
        scope: LimitScope,
        caller: &str,
        window: &VecDeque<Instant>,
        now: Instant,
    ) -> RateLimitDenied {
        let limit = match scope {
            LimitScope::Caller => self.per_caller_limit,
            LimitScope::Global => self.global_limit,
        };
        let retry_after = retry_after(window, now, self.window);

        tracing::debug!(
            caller = %caller,
            scope = %scope,
            limit,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate limit denied"
        );

        RateLimitDenied {
            scope,
            caller: caller.to_string(),
            limit,
            window: self.window,
            retry_after,
        }
    }

    /// Current window occupancy for `caller`.
    pub fn usage(&self, caller: &str) -> WindowUsage {
        let now = Instant::now();
        let caller_count = match self.callers.get_mut(caller) {
            Some(mut entry) => {
                purge(&mut entry, now, self.window);
                entry.len() as u32
            }
            None => 0,
        };
        let global_count = {
            let mut global = self.global.lock();
            purge(&mut global, now, self.window);
            global.len() as u32
        };

        WindowUsage {
            caller_count,
            caller_remaining: self.per_caller_limit.saturating_sub(caller_count),
            global_count,
            global_remaining: self.global_limit.saturating_sub(global_count),
        }
    }

    /// Forget callers whose windows have fully expired.
    pub fn prune_idle(&self) {
        let now = Instant::now();
        self.callers.retain(|_, window| {
            purge(window, now, self.window);
            !window.is_empty()
        });
    }

    pub fn tracked_callers(&self) -> usize {
        self.callers.len()
    }
}
