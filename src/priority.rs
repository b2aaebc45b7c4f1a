//! Candidate filtering and priority-tier selection.
use std::{cmp::Reverse, collections::BTreeMap};

use rand::{seq::SliceRandom, Rng};

use crate::{
    clock::Timestamp, display_status::DisplayStatusStore, frequency::is_eligible,
    models::ContentBlockDefinition,
};

/// Everything needed to decide whether a block may be shown right now.
#[derive(Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Placeholder being filled.
    pub placeholder_key: &'a str,
    /// Instant date windows and frequency policies are checked against.
    pub now: Timestamp,
    /// Display history read by frequency policies.
    pub statuses: &'a DisplayStatusStore,
}

impl<'a> SelectionContext<'a> {
    /// Return `true` if `block` passes the placeholder, date, frequency and content checks.
    pub fn admits(&self, block: &ContentBlockDefinition) -> bool {
        if !block.serves(self.placeholder_key) {
            return false;
        }
        if matches!(block.date_filter, Some(filter) if !filter.allows(self.now)) {
            log::trace!(target: "content_blocks",
                        block_id:display = block.id;
                        "block is outside of its date window");
            return false;
        }
        let status = self.statuses.status_of(&block.id);
        if !is_eligible(&block.frequency_policy, &status, block.session_start) {
            log::trace!(target: "content_blocks",
                        block_id:display = block.id,
                        policy:debug = block.frequency_policy;
                        "block is not eligible under its frequency policy");
            return false;
        }
        // Static content needs no round-trip; personalized blocks need an OK payload.
        block.raw_content.is_some()
            || block
                .personalization
                .as_ref()
                .is_some_and(|p| p.is_showable())
    }
}

/// Return every admitted candidate, preserving input order.
pub fn eligible<'a>(
    candidates: impl IntoIterator<Item = &'a ContentBlockDefinition>,
    ctx: &SelectionContext<'_>,
) -> Vec<&'a ContentBlockDefinition> {
    candidates
        .into_iter()
        .filter(|block| ctx.admits(block))
        .collect()
}

/// Pick the block to show: admitted candidates are grouped by priority, the highest tier wins and
/// a block is drawn uniformly at random from it.
///
/// Ties are randomized on purpose so impressions are spread across same-priority blocks.
///
/// Returns `None` if nothing survives filtering, which means "no content for this placeholder".
pub fn select<'a, R: Rng + ?Sized>(
    candidates: impl IntoIterator<Item = &'a ContentBlockDefinition>,
    ctx: &SelectionContext<'_>,
    rng: &mut R,
) -> Option<&'a ContentBlockDefinition> {
    let mut tiers: BTreeMap<i64, Vec<&'a ContentBlockDefinition>> = BTreeMap::new();
    for block in eligible(candidates, ctx) {
        tiers.entry(block.priority).or_default().push(block);
    }

    let (priority, tier) = tiers.into_iter().next_back()?;
    let selected = tier.choose(rng).copied();

    if let Some(block) = selected {
        log::trace!(target: "content_blocks",
                    placeholder_key = ctx.placeholder_key,
                    block_id:display = block.id,
                    priority,
                    tier_size = tier.len();
                    "selected content block");
    }
    selected
}

/// Order blocks for a carousel: priority descending, then name ascending, so the order stays
/// stable across reloads.
pub fn carousel_order(blocks: &mut [&ContentBlockDefinition]) {
    blocks.sort_by(|a, b| {
        (Reverse(a.priority), &a.name).cmp(&(Reverse(b.priority), &b.name))
    });
}
