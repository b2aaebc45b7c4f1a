//! Frequency policy evaluation.
use crate::{clock::Timestamp, display_status::DisplayStatus, models::FrequencyPolicy};

/// Return `true` if a block governed by `policy` may be shown given its display history.
///
/// `session_start` is the instant the block definition was loaded; `OnlyOnce` only blocks a
/// display that happened within the current session.
pub fn is_eligible(
    policy: &FrequencyPolicy,
    status: &DisplayStatus,
    session_start: Timestamp,
) -> bool {
    match policy {
        FrequencyPolicy::Always => true,
        FrequencyPolicy::OncePerVisit => status.displayed_at.is_none(),
        FrequencyPolicy::OnlyOnce => match status.displayed_at {
            None => true,
            Some(displayed_at) => displayed_at < session_start,
        },
        FrequencyPolicy::UntilInteracted => status.interacted_at.is_none(),
        FrequencyPolicy::Unknown(policy) => {
            log::warn!(target: "content_blocks",
                       policy:display = policy;
                       "unknown frequency policy, treating block as always eligible");
            true
        }
    }
}
