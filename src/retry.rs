use crate::config::Config;
use chrono::{NaiveDateTime, NaiveTime};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

pub const DEFAULT_NETWORK_KEYWORDS: &[&str] = &["network", "timeout", "connection", "temporary"];

const LIMIT_PHRASES: &[&str] = &["session limit", "usage limit"];

// Accepts "resets at 3pm", "reset 18:45", "Resets at 9:30 PM" and the like.
static RESET_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)reset(?:s)?(?:\s+at)?\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?")
        .expect("reset-time pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    SessionLimit,
    Network,
    Other,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::SessionLimit => "session_limit",
            FailureClass::Network => "network",
            FailureClass::Other => "other",
        }
    }
}

/// Outcome of classifying one child invocation: either the iteration is done,
/// or the caller should wait and re-invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Done,
    Wait {
        class: FailureClass,
        delay: Duration,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub network_keywords: Vec<String>,
    pub network_base_secs: u64,
    pub network_max_secs: u64,
    pub other_base_secs: u64,
    pub other_max_secs: u64,
    pub session_limit_buffer_secs: u64,
    pub session_limit_fallback_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_keywords: DEFAULT_NETWORK_KEYWORDS
                .iter()
                .map(ToString::to_string)
                .collect(),
            network_base_secs: 5,
            network_max_secs: 300,
            other_base_secs: 10,
            other_max_secs: 600,
            session_limit_buffer_secs: 300,
            session_limit_fallback_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            network_keywords: config
                .get("retry.network_keywords")
                .map(|raw| split_keywords(&raw))
                .filter(|keywords| !keywords.is_empty())
                .unwrap_or(defaults.network_keywords),
            network_base_secs: config
                .get_u64("retry.network_base_secs")
                .unwrap_or(defaults.network_base_secs),
            network_max_secs: config
                .get_u64("retry.network_max_secs")
                .unwrap_or(defaults.network_max_secs),
            other_base_secs: config
                .get_u64("retry.other_base_secs")
                .unwrap_or(defaults.other_base_secs),
            other_max_secs: config
                .get_u64("retry.other_max_secs")
                .unwrap_or(defaults.other_max_secs),
            session_limit_buffer_secs: config
                .get_u64("retry.session_limit_buffer_secs")
                .unwrap_or(defaults.session_limit_buffer_secs),
            session_limit_fallback_secs: config
                .get_u64("retry.session_limit_fallback_secs")
                .unwrap_or(defaults.session_limit_fallback_secs),
        }
    }

    /// Classifies one invocation. Pure: no I/O, no sleeping; the caller owns
    /// the wait. `attempt` is 1-based within the current iteration; zero is
    /// treated as one. `now` is the local wall-clock time used for
    /// session-limit reset arithmetic.
    pub fn classify(
        &self,
        stdout: &str,
        exit_code: i32,
        attempt: u32,
        now: NaiveDateTime,
    ) -> Verdict {
        if exit_code == 0 {
            return Verdict::Done;
        }
        let attempt = attempt.max(1);
        let lowered = stdout.to_lowercase();

        if LIMIT_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
            let delay_secs = parse_reset_time(stdout)
                .and_then(|reset| seconds_until_next(now, &reset))
                .map(|secs| secs.saturating_add(self.session_limit_buffer_secs))
                .unwrap_or(self.session_limit_fallback_secs);
            return Verdict::Wait {
                class: FailureClass::SessionLimit,
                delay: Duration::from_secs(delay_secs),
            };
        }

        if self
            .network_keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
        {
            return Verdict::Wait {
                class: FailureClass::Network,
                delay: Duration::from_secs(backoff(
                    self.network_base_secs,
                    self.network_max_secs,
                    attempt,
                )),
            };
        }

        Verdict::Wait {
            class: FailureClass::Other,
            delay: Duration::from_secs(backoff(
                self.other_base_secs,
                self.other_max_secs,
                attempt,
            )),
        }
    }
}

fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn backoff(base: u64, cap: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(63);
    base.saturating_mul(1u64 << exponent).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResetSpec {
    hour: u32,
    minute: u32,
    meridiem: Option<Meridiem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

fn parse_reset_time(text: &str) -> Option<ResetSpec> {
    let caps = RESET_TIME.captures(text)?;
    let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(group) => group.as_str().parse().ok()?,
        None => 0,
    };
    let meridiem = caps.get(3).map(|group| {
        if group.as_str().eq_ignore_ascii_case("pm") {
            Meridiem::Pm
        } else {
            Meridiem::Am
        }
    });

    if minute > 59 {
        return None;
    }
    let hour_valid = match meridiem {
        Some(_) => (1..=12).contains(&hour),
        None => hour <= 23,
    };
    if !hour_valid {
        return None;
    }

    Some(ResetSpec {
        hour,
        minute,
        meridiem,
    })
}

/// Seconds from `now` until the next occurrence of the stated clock time.
/// Without am/pm the hour is ambiguous; both readings are candidates and the
/// earliest strictly future one wins.
fn seconds_until_next(now: NaiveDateTime, reset: &ResetSpec) -> Option<u64> {
    let hours: Vec<u32> = match reset.meridiem {
        Some(Meridiem::Am) => vec![reset.hour % 12],
        Some(Meridiem::Pm) => vec![reset.hour % 12 + 12],
        None => {
            if (1..=11).contains(&reset.hour) {
                vec![reset.hour, reset.hour + 12]
            } else {
                vec![reset.hour]
            }
        }
    };

    let mut best: Option<NaiveDateTime> = None;
    for hour in hours {
        let time = NaiveTime::from_hms_opt(hour, reset.minute, 0)?;
        let mut candidate = now.date().and_time(time);
        if candidate <= now {
            candidate = now.date().succ_opt()?.and_time(time);
        }
        if best.is_none_or(|current| candidate < current) {
            best = Some(candidate);
        }
    }

    let target = best?;
    u64::try_from((target - now).num_seconds()).ok()
}
