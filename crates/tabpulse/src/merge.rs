//! Session merging.
//!
//! A candidate either extends the buffer tail (same locator, inside the pulse
//! window) or starts a new session. Pure: callers read the tail and persist
//! whatever comes back.

use chrono::Duration;

use crate::event::ActivityEvent;

/// Decision for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// Replace the tail with this updated event.
    Extend(ActivityEvent),
    /// Push the candidate as a new tail.
    Append(ActivityEvent),
}

impl MergeResult {
    pub fn is_extend(&self) -> bool {
        matches!(self, MergeResult::Extend(_))
    }

    pub fn into_event(self) -> ActivityEvent {
        match self {
            MergeResult::Extend(event) | MergeResult::Append(event) => event,
        }
    }
}

const WINDOW_LIMIT_MS: i64 = i64::MAX / 4;

/// Pulse window in whole milliseconds. May be zero or negative.
pub(crate) fn window_millis(pulse_window_secs: f64) -> i64 {
    if pulse_window_secs.is_nan() {
        return 0;
    }
    // `as` saturates, the clamp keeps chrono arithmetic in range
    ((pulse_window_secs * 1000.0).round() as i64).clamp(-WINDOW_LIMIT_MS, WINDOW_LIMIT_MS)
}

/// Merge `candidate` into `last`.
///
/// The window end is `last.timestamp + last.duration + pulse_window`, and the
/// boundary is inclusive. An extended tail keeps its start and never gets
/// shorter.
pub fn merge(
    last: Option<&ActivityEvent>,
    candidate: ActivityEvent,
    pulse_window_secs: f64,
) -> MergeResult {
    let Some(last) = last else {
        return MergeResult::Append(candidate);
    };

    if last.origin.url != candidate.origin.url {
        return MergeResult::Append(candidate);
    }

    // A tail whose end can't be represented never absorbs a candidate
    let Some(end) = last.end() else {
        return MergeResult::Append(candidate);
    };
    let window = Duration::milliseconds(window_millis(pulse_window_secs));
    let inside = match end.checked_add_signed(window) {
        Some(window_end) => candidate.timestamp <= window_end,
        None => window > Duration::zero(),
    };
    if !inside {
        return MergeResult::Append(candidate);
    }

    let proposed = (candidate.timestamp - last.timestamp)
        .num_milliseconds()
        .max(0) as u64;

    let mut updated = last.clone();
    updated.duration_ms = last.duration_ms.max(proposed);
    if let Some(actor) = candidate.actor.filter(|actor| !actor.trim().is_empty()) {
        updated.actor = Some(actor);
    }

    MergeResult::Extend(updated)
}
