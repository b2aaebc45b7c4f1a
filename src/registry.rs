//! Authoritative set of known content blocks and their lifecycle.
use std::collections::BTreeMap;

use rand::Rng;

use crate::{
    clock::Timestamp,
    display_status::DisplayStatusStore,
    models::{ContentBlockDefinition, Personalization},
    priority::{self, SelectionContext},
    render_session::RenderTag,
    Error, Result,
};

/// Lifecycle of a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Neither static content nor personalization. Must be fetched before selection.
    Unresolved,
    /// A fetch is queued or running.
    Resolving,
    /// Has content, static or personalized.
    Resolved,
    /// The last fetch failed (or produced corrupted content) and no usable payload is held. The
    /// block is excluded from selection until the next successful fetch.
    Failed,
}

#[derive(Debug, Clone)]
struct Entry {
    definition: ContentBlockDefinition,
    state: BlockState,
    needs_refresh: bool,
}

impl Entry {
    fn new(definition: ContentBlockDefinition) -> Entry {
        let state = if definition.is_unresolved() {
            BlockState::Unresolved
        } else {
            BlockState::Resolved
        };
        Entry {
            definition,
            state,
            needs_refresh: false,
        }
    }

    fn is_expired(&self, now: Timestamp) -> bool {
        if self.definition.raw_content.is_some() {
            return false;
        }
        self.definition
            .personalization
            .as_ref()
            .is_some_and(|p| p.expires_at() < now)
    }
}

/// In-memory registry of content block definitions, keyed by id.
///
/// Single-writer: callers mutate it from one coordinating task.
#[derive(Debug, Default)]
pub struct ContentBlockRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ContentBlockRegistry {
    #[allow(missing_docs)]
    pub fn new() -> ContentBlockRegistry {
        ContentBlockRegistry::default()
    }

    /// Replace every known definition.
    pub fn load(&mut self, definitions: impl IntoIterator<Item = ContentBlockDefinition>) {
        self.entries = definitions
            .into_iter()
            .map(|definition| (definition.id.clone(), Entry::new(definition)))
            .collect();
        log::debug!(target: "content_blocks",
                    count = self.entries.len();
                    "loaded content block definitions");
    }

    /// Definition of `block_id`, whatever its state.
    pub fn get(&self, block_id: &str) -> Option<&ContentBlockDefinition> {
        self.entries.get(block_id).map(|entry| &entry.definition)
    }

    /// Lifecycle state of `block_id`.
    pub fn state(&self, block_id: &str) -> Option<BlockState> {
        self.entries.get(block_id).map(|entry| entry.state)
    }

    /// Every known definition, ordered by id.
    pub fn definitions(&self) -> impl Iterator<Item = &ContentBlockDefinition> {
        self.entries.values().map(|entry| &entry.definition)
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Blocks assigned to `placeholder_key` that may take part in selection.
    pub fn candidates<'a, 'k>(
        &'a self,
        placeholder_key: &'k str,
    ) -> impl Iterator<Item = &'a ContentBlockDefinition> + 'k
    where
        'a: 'k,
    {
        self.entries
            .values()
            .filter(move |entry| {
                entry.state != BlockState::Failed && entry.definition.serves(placeholder_key)
            })
            .map(|entry| &entry.definition)
    }

    /// Select the block to show in `placeholder_key`. `None` means there is nothing to show.
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        placeholder_key: &str,
        statuses: &DisplayStatusStore,
        now: Timestamp,
        rng: &mut R,
    ) -> Option<&ContentBlockDefinition> {
        let ctx = SelectionContext {
            placeholder_key,
            now,
            statuses,
        };
        priority::select(self.candidates(placeholder_key), &ctx, rng)
    }

    /// Blocks of `placeholder_key` that have to be fetched before selection can trust them:
    /// unresolved, TTL-expired or marked for refresh. Failed and in-flight blocks are skipped.
    pub fn blocks_needing_fetch(&self, placeholder_key: &str, now: Timestamp) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.definition.serves(placeholder_key))
            .filter(|entry| match entry.state {
                BlockState::Unresolved => true,
                BlockState::Resolved => entry.needs_refresh || entry.is_expired(now),
                BlockState::Resolving | BlockState::Failed => false,
            })
            .map(|entry| entry.definition.id.clone())
            .collect()
    }

    /// Personalized blocks of `placeholder_key`, failed ones included. Used by explicit refresh.
    pub fn personalized_blocks(&self, placeholder_key: &str) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| {
                entry.definition.serves(placeholder_key)
                    && entry.definition.raw_content.is_none()
                    && entry.state != BlockState::Resolving
            })
            .map(|entry| entry.definition.id.clone())
            .collect()
    }

    /// Force a fetch of `block_id` the next time its placeholder is resolved.
    pub fn mark_needs_refresh(&mut self, block_id: &str) -> Result<()> {
        self.entry_mut(block_id)?.needs_refresh = true;
        Ok(())
    }

    /// Record that a fetch for `block_id` has been queued.
    pub fn mark_resolving(&mut self, block_id: &str) -> Result<()> {
        self.entry_mut(block_id)?.state = BlockState::Resolving;
        Ok(())
    }

    /// A block is expired when its personalization outlived its TTL. Static blocks never expire.
    pub fn is_expired(&self, block_id: &str, now: Timestamp) -> bool {
        self.entries
            .get(block_id)
            .is_some_and(|entry| entry.is_expired(now))
    }

    /// Store a freshly fetched personalization, observed at `now`.
    pub fn apply_fetch_result(
        &mut self,
        block_id: &str,
        mut personalization: Personalization,
        now: Timestamp,
    ) -> Result<()> {
        let entry = self.entry_mut(block_id)?;
        personalization.ttl_observed_at = now;
        entry.state = if personalization.corrupted {
            log::warn!(target: "content_blocks",
                       block_id;
                       "excluding content block with corrupted content");
            BlockState::Failed
        } else {
            BlockState::Resolved
        };
        entry.needs_refresh = false;
        entry.definition.personalization = Some(personalization);
        Ok(())
    }

    /// Classify a failed fetch. A block still holding a usable payload keeps it for one more TTL
    /// cycle; any other block is excluded until its next successful fetch.
    pub fn apply_fetch_failure(&mut self, block_id: &str, now: Timestamp) -> Result<BlockState> {
        let entry = self.entry_mut(block_id)?;
        entry.state = match &mut entry.definition.personalization {
            Some(personalization) if personalization.is_showable() => {
                personalization.ttl_observed_at = now;
                BlockState::Resolved
            }
            _ if entry.definition.raw_content.is_some() => BlockState::Resolved,
            _ => BlockState::Failed,
        };
        entry.needs_refresh = false;
        log::warn!(target: "content_blocks",
                   block_id,
                   state:debug = entry.state;
                   "content block fetch failed");
        Ok(entry.state)
    }

    /// Exclude a block whose content cannot be shown.
    pub fn mark_corrupted(&mut self, block_id: &str) -> Result<()> {
        let entry = self.entry_mut(block_id)?;
        entry.state = BlockState::Failed;
        if let Some(personalization) = &mut entry.definition.personalization {
            personalization.corrupted = true;
        }
        Ok(())
    }

    /// Drop personalization and tags of `block_id`, keeping its static definition.
    pub fn invalidate(&mut self, block_id: &str) -> Result<()> {
        let entry = self.entry_mut(block_id)?;
        entry.definition.personalization = None;
        entry.definition.tags.clear();
        *entry = Entry::new(entry.definition.clone());
        Ok(())
    }

    /// [`ContentBlockRegistry::invalidate`] every block.
    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.definition.personalization = None;
            entry.definition.tags.clear();
            entry.needs_refresh = false;
            entry.state = if entry.definition.is_unresolved() {
                BlockState::Unresolved
            } else {
                BlockState::Resolved
            };
        }
    }

    /// Associate a render session with `block_id`.
    pub fn add_tag(&mut self, block_id: &str, tag: RenderTag) -> Result<()> {
        self.entry_mut(block_id)?.definition.tags.insert(tag);
        Ok(())
    }

    /// Forget a render session, whichever block it belongs to.
    pub fn remove_tag(&mut self, tag: RenderTag) {
        for entry in self.entries.values_mut() {
            entry.definition.tags.remove(&tag);
        }
    }

    /// Block currently rendered by the session `tag`.
    pub fn block_for_tag(&self, tag: RenderTag) -> Option<&ContentBlockDefinition> {
        self.definitions()
            .find(|definition| definition.tags.contains(&tag))
    }

    fn entry_mut(&mut self, block_id: &str) -> Result<&mut Entry> {
        self.entries
            .get_mut(block_id)
            .ok_or_else(|| Error::UnknownBlock(block_id.to_owned()))
    }
}
