//! Per-client request rate limiting.
//!
//! The connection handler only sees the [`RateLimiter`] trait; the in-memory
//! [`FixedWindowLimiter`] is the backend the gateway ships with.

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests still available in the current window.
    pub remaining: u64,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

/// Decides whether a client identified by `key` may make a request now.
///
/// Implementations are shared by every connection task and must be safe for
/// concurrent use.
pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str) -> Result<RateLimitDecision>;
}

/// Requests allowed per period, parsed from `<count>-<period>` where period is
/// one of `S`, `M`, `H` or `D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    pub limit: u64,
    pub period: Duration,
}

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

const PERIODS: [(&str, Duration); 4] = [("S", SECOND), ("M", MINUTE), ("H", HOUR), ("D", DAY)];

impl FromStr for RateSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (count, period) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| anyhow!("Invalid rate '{s}': expected <count>-<period>"))?;

        let limit: u64 = count
            .parse()
            .with_context(|| format!("Invalid rate '{s}': count must be a positive integer"))?;
        if limit == 0 {
            bail!("Invalid rate '{s}': count must be at least 1");
        }

        let Some(&(_, period)) = PERIODS
            .iter()
            .find(|(unit, _)| unit.eq_ignore_ascii_case(period))
        else {
            bail!("Invalid rate '{s}': unknown period '{period}', expected S, M, H or D");
        };

        Ok(Self { limit, period })
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match PERIODS.iter().find(|(_, period)| *period == self.period) {
            Some((unit, _)) => write!(f, "{}-{unit}", self.limit),
            None => write!(f, "{}/{:?}", self.limit, self.period),
        }
    }
}

struct Window {
    count: u64,
    started: Instant,
}

struct LimiterState {
    windows: HashMap<String, Window>,
    last_prune: Instant,
}

/// In-memory fixed-window counter keyed by client.
///
/// A key's window opens on its first request and lasts one period; once
/// `limit` requests have been counted in the window, further requests are
/// refused until it expires.
pub struct FixedWindowLimiter {
    spec: RateSpec,
    state: Mutex<LimiterState>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(spec: RateSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_prune: Instant::now(),
            }),
        }
    }

    /// Number of keys currently tracked.
    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.state.lock().map_or(0, |state| state.windows.len())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<RateLimitDecision> {
        let period = self.spec.period;
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("Rate limiter state poisoned"))?;

        if now.duration_since(state.last_prune) >= period {
            state
                .windows
                .retain(|_, window| now.duration_since(window.started) < period);
            state.last_prune = now;
        }

        let window = state
            .windows
            .entry(key.to_owned())
            .or_insert(Window { count: 0, started: now });
        if now.duration_since(window.started) >= period {
            *window = Window { count: 0, started: now };
        }

        let reset_after = period.saturating_sub(now.duration_since(window.started));
        if window.count >= self.spec.limit {
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after,
            });
        }

        window.count += 1;
        Ok(RateLimitDecision {
            allowed: true,
            remaining: self.spec.limit - window.count,
            reset_after,
        })
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str) -> Result<RateLimitDecision> {
        self.check_at(key, Instant::now())
    }
}
