//! Correlation of asynchronous render results with the render request that produced them.
//!
//! Render sessions live in a generational arena. A [`RenderTag`] is the index of a slot plus the
//! generation the slot had when the session was created, so a height reported for a session that
//! was released in the meantime is detected instead of landing on whatever reused the slot.
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque identifier of a render session.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display("{index}.{generation}")]
pub struct RenderTag {
    index: u32,
    generation: u32,
}

/// One attempt to display a block's HTML in a native renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSession {
    /// Handle of this session.
    pub tag: RenderTag,
    /// Placeholder group the session belongs to.
    pub placeholder_key: String,
    /// Block being rendered.
    pub block_id: String,
    /// Position inside the placeholder (e.g., the carousel page).
    pub slot: usize,
    /// `0.0` until a measurement completes.
    pub measured_height: f32,
    /// At most one session per placeholder group is active.
    pub is_active: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    session: Option<RenderSession>,
}

/// Arena of render sessions enforcing "exactly one active session per placeholder group".
#[derive(Debug, Default)]
pub struct RenderSessionTracker {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl RenderSessionTracker {
    #[allow(missing_docs)]
    pub fn new() -> RenderSessionTracker {
        RenderSessionTracker::default()
    }

    /// Create an inactive session with no measured height and return its tag.
    pub fn begin(
        &mut self,
        placeholder_key: impl Into<String>,
        block_id: impl Into<String>,
        slot: usize,
    ) -> RenderTag {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[index as usize];
        let tag = RenderTag {
            index,
            generation: entry.generation,
        };
        entry.session = Some(RenderSession {
            tag,
            placeholder_key: placeholder_key.into(),
            block_id: block_id.into(),
            slot,
            measured_height: 0.0,
            is_active: false,
        });
        tag
    }

    /// Session identified by `tag`, unless it has been released.
    pub fn get(&self, tag: RenderTag) -> Option<&RenderSession> {
        let entry = self.slots.get(tag.index as usize)?;
        if entry.generation != tag.generation {
            return None;
        }
        entry.session.as_ref()
    }

    fn get_mut(&mut self, tag: RenderTag) -> Result<&mut RenderSession> {
        self.slots
            .get_mut(tag.index as usize)
            .filter(|entry| entry.generation == tag.generation)
            .and_then(|entry| entry.session.as_mut())
            .ok_or(Error::StaleRenderSession(tag))
    }

    /// Sessions belonging to `placeholder_key`.
    pub fn sessions<'a, 'k>(
        &'a self,
        placeholder_key: &'k str,
    ) -> impl Iterator<Item = &'a RenderSession> + 'k
    where
        'a: 'k,
    {
        self.slots
            .iter()
            .filter_map(|entry| entry.session.as_ref())
            .filter(move |session| session.placeholder_key == placeholder_key)
    }

    /// Tag of an existing session rendering `block_id` in `placeholder_key`. The lowest tag wins
    /// when several exist.
    pub fn tag_for(&self, placeholder_key: &str, block_id: &str) -> Option<RenderTag> {
        self.sessions(placeholder_key)
            .filter(|session| session.block_id == block_id)
            .map(|session| session.tag)
            .min()
    }

    /// The active session of `placeholder_key`.
    pub fn active(&self, placeholder_key: &str) -> Option<&RenderSession> {
        self.sessions(placeholder_key)
            .find(|session| session.is_active)
    }

    /// Record the height measured for `tag` and return the tag of the session holding it.
    ///
    /// A session that already has a height is never overwritten: the height goes to another
    /// zero-height session rendering the same block in the same placeholder group, or to a new
    /// inactive session when there is none.
    ///
    /// # Errors
    ///
    /// [`Error::StaleRenderSession`] if `tag` was released.
    pub fn report_height(&mut self, tag: RenderTag, height: f32) -> Result<RenderTag> {
        let session = self.get_mut(tag)?;
        if session.measured_height == 0.0 {
            session.measured_height = height;
            return Ok(tag);
        }

        let placeholder_key = session.placeholder_key.clone();
        let block_id = session.block_id.clone();
        let slot = session.slot;

        let unmeasured = self
            .sessions(&placeholder_key)
            .find(|s| s.block_id == block_id && s.measured_height == 0.0)
            .map(|s| s.tag);
        let target = match unmeasured {
            Some(existing) => existing,
            None => self.begin(placeholder_key, block_id, slot),
        };
        self.get_mut(target)?.measured_height = height;
        Ok(target)
    }

    /// Forget the height measured for `tag`, e.g., after its block's payload was re-fetched.
    ///
    /// # Errors
    ///
    /// [`Error::StaleRenderSession`] if `tag` was released.
    pub fn reset_height(&mut self, tag: RenderTag) -> Result<()> {
        self.get_mut(tag)?.measured_height = 0.0;
        Ok(())
    }

    /// Make `tag` the only active session of its placeholder group.
    ///
    /// # Errors
    ///
    /// [`Error::StaleRenderSession`] if `tag` was released.
    pub fn activate(&mut self, tag: RenderTag) -> Result<()> {
        let placeholder_key = self.get_mut(tag)?.placeholder_key.clone();
        for entry in &mut self.slots {
            if let Some(session) = &mut entry.session {
                if session.placeholder_key == placeholder_key {
                    session.is_active = false;
                }
            }
        }
        self.get_mut(tag)?.is_active = true;
        log::debug!(target: "content_blocks",
                    tag:display = tag,
                    placeholder_key:display = placeholder_key;
                    "activated render session");
        Ok(())
    }

    /// Deactivate every session of `placeholder_key` and reset their heights, so the placeholder
    /// takes no space. Returns the affected tags.
    pub fn collapse(&mut self, placeholder_key: &str) -> Vec<RenderTag> {
        let mut collapsed = Vec::new();
        for entry in &mut self.slots {
            if let Some(session) = &mut entry.session {
                if session.placeholder_key == placeholder_key {
                    session.is_active = false;
                    session.measured_height = 0.0;
                    collapsed.push(session.tag);
                }
            }
        }
        collapsed
    }

    /// Drop the session, invalidating `tag` and every copy of it.
    pub fn release(&mut self, tag: RenderTag) -> Option<RenderSession> {
        let entry = self.slots.get_mut(tag.index as usize)?;
        if entry.generation != tag.generation {
            return None;
        }
        let session = entry.session.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(tag.index);
        Some(session)
    }

    /// Release every session.
    pub fn clear(&mut self) -> Vec<RenderSession> {
        let tags: Vec<_> = self
            .slots
            .iter()
            .filter_map(|entry| entry.session.as_ref().map(|s| s.tag))
            .collect();
        tags.into_iter().filter_map(|tag| self.release(tag)).collect()
    }
}
