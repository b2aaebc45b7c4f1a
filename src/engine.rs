//! The UI-facing composition root.
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use rand::{rngs::StdRng, SeedableRng};
use tokio::task::JoinHandle;

use crate::{
    carousel::{CarouselConfig, CarouselItem, CarouselRotation},
    clock::Clock,
    config::EngineConfig,
    coordinator::{FetchCoordinator, FetchOutcome, PendingFetch},
    display_status::DisplayStatusStore,
    fetcher::PersonalizationFetcher,
    frequency::is_eligible,
    models::{ContentBlockDefinition, DefinitionsResponse},
    priority::{self, SelectionContext},
    registry::ContentBlockRegistry,
    render::{ContentBlockAction, HeightMeasurer, HtmlNormalizer, NormalizedHtml},
    render_session::{RenderSessionTracker, RenderTag},
    tracking::{ContentBlockEvent, TrackingAction, TrackingSink},
    Error, Result,
};

/// Content ready to be handed to a renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedContent {
    /// Render session now active for the placeholder.
    pub tag: RenderTag,
    #[allow(missing_docs)]
    pub placeholder_key: String,
    /// Block selected for the placeholder.
    pub block_id: String,
    /// Normalized HTML.
    pub html: String,
    /// Links and buttons found in [`Self::html`].
    pub actions: Vec<ContentBlockAction>,
    /// Measured height. Always positive: unmeasurable content collapses the placeholder instead.
    pub height: f32,
}

/// Verdict on a carousel item that just finished displaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarouselItemCheck {
    /// Keep showing it.
    Valid,
    /// Frequency policy or date window no longer allows it. Remove it from the carousel.
    Invalid,
    /// Personalization expired. Reload the carousel after refreshing.
    NeedsRefresh,
}

/// Content block engine: owns the registry, render sessions and display statuses, and drives
/// fetches through a [`FetchCoordinator`].
///
/// The engine is single-writer: every mutating method takes `&mut self` and is meant to be called
/// from the task coordinating the UI. Fetching and measuring run on the coordinator's worker and
/// only hand values back.
pub struct ContentBlocksEngine {
    registry: ContentBlockRegistry,
    sessions: RenderSessionTracker,
    statuses: DisplayStatusStore,
    coordinator: FetchCoordinator,
    worker: JoinHandle<()>,
    normalizer: Arc<dyn HtmlNormalizer>,
    clock: Arc<dyn Clock>,
    tracking_sink: Box<dyn TrackingSink>,
    carousel: CarouselConfig,
    rng: StdRng,
}

impl ContentBlocksEngine {
    /// Create an engine and spawn its fetch worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start<F, M>(config: EngineConfig, fetcher: F, measurer: M) -> ContentBlocksEngine
    where
        F: PersonalizationFetcher,
        M: HeightMeasurer,
    {
        let (coordinator, worker) = FetchCoordinator::start(
            fetcher,
            measurer,
            config.normalizer.clone(),
            config.clock.clone(),
            config.coordinator(),
        );
        let statuses = DisplayStatusStore::open(
            config.status_storage,
            config.status_retention,
            config.clock.now(),
        );
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        ContentBlocksEngine {
            registry: ContentBlockRegistry::new(),
            sessions: RenderSessionTracker::new(),
            statuses,
            coordinator,
            worker,
            normalizer: config.normalizer,
            clock: config.clock,
            tracking_sink: config.tracking_sink,
            carousel: config.carousel,
            rng,
        }
    }

    /// Blocks known to the engine and their lifecycle state.
    pub fn registry(&self) -> &ContentBlockRegistry {
        &self.registry
    }

    /// Render sessions created by [`Self::prepare`] and [`Self::report_height`].
    pub fn sessions(&self) -> &RenderSessionTracker {
        &self.sessions
    }

    /// Display and interaction history used by frequency policies.
    pub fn statuses(&self) -> &DisplayStatusStore {
        &self.statuses
    }

    /// Fetch requests accepted and not completed yet.
    pub fn pending_fetches(&self) -> usize {
        self.coordinator.pending()
    }

    /// Replace the known definitions.
    pub fn load_definitions(&mut self, definitions: Vec<ContentBlockDefinition>) {
        self.registry.load(definitions);
    }

    /// [`ContentBlocksEngine::load_definitions`] from a definitions endpoint response. The
    /// definitions are stamped with the current instant as their session start.
    pub fn load_response(&mut self, response: DefinitionsResponse) {
        let definitions = response.into_definitions(self.clock.now());
        self.registry.load(definitions);
    }

    /// Select the block to show in `placeholder_key` from what is already known, without
    /// fetching. `None` means there is nothing to show.
    pub fn resolve(&mut self, placeholder_key: &str) -> Option<&ContentBlockDefinition> {
        let now = self.clock.now();
        self.registry
            .resolve(placeholder_key, &self.statuses, now, &mut self.rng)
    }

    /// Fetch every block of `placeholder_key` that is unresolved, expired or marked for refresh.
    pub async fn ensure_fresh(&mut self, placeholder_key: &str) -> Vec<FetchOutcome> {
        let block_ids = self
            .registry
            .blocks_needing_fetch(placeholder_key, self.clock.now());
        self.fetch_blocks(block_ids, placeholder_key).await
    }

    /// Re-fetch every personalized block of `placeholder_key`, failed ones included.
    pub async fn refresh_placeholder(&mut self, placeholder_key: &str) -> Vec<FetchOutcome> {
        let block_ids = self.registry.personalized_blocks(placeholder_key);
        self.fetch_blocks(block_ids, placeholder_key).await
    }

    /// Fetch personalization ahead of time for every block assigned to any of `placeholder_keys`.
    pub async fn prefetch(&mut self, placeholder_keys: &[&str]) -> Vec<FetchOutcome> {
        let now = self.clock.now();
        let mut seen = BTreeSet::new();
        let mut pending = Vec::new();
        for placeholder_key in placeholder_keys {
            for block_id in self.registry.blocks_needing_fetch(placeholder_key, now) {
                if seen.insert(block_id.clone()) {
                    pending.extend(self.enqueue(block_id, placeholder_key));
                }
            }
        }
        self.complete(pending).await
    }

    async fn fetch_blocks(
        &mut self,
        block_ids: Vec<String>,
        placeholder_key: &str,
    ) -> Vec<FetchOutcome> {
        let pending: Vec<_> = block_ids
            .into_iter()
            .filter_map(|block_id| self.enqueue(block_id, placeholder_key))
            .collect();
        self.complete(pending).await
    }

    fn enqueue(&mut self, block_id: String, placeholder_key: &str) -> Option<PendingFetch> {
        match self.coordinator.enqueue(block_id.clone(), placeholder_key) {
            Ok(pending) => {
                // Block ids come from the registry, so marking cannot fail.
                let _ = self.registry.mark_resolving(&block_id);
                Some(pending)
            }
            Err(err) => {
                log::warn!(target: "content_blocks",
                           block_id,
                           placeholder_key;
                           "unable to queue personalization fetch: {err}");
                None
            }
        }
    }

    async fn complete(&mut self, pending: Vec<PendingFetch>) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::with_capacity(pending.len());
        for pending in pending {
            let outcome = pending.await;
            self.apply_outcome(&outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    fn apply_outcome(&mut self, outcome: &FetchOutcome) {
        let now = self.clock.now();
        let applied = match &outcome.personalization {
            Some(personalization) => {
                let corrupted = personalization.corrupted;
                let result = self.registry.apply_fetch_result(
                    &outcome.block_id,
                    personalization.clone(),
                    now,
                );
                if corrupted {
                    self.track_error(
                        &outcome.block_id,
                        &outcome.placeholder_key,
                        outcome.error.as_ref(),
                    );
                }
                result
            }
            None => self
                .registry
                .apply_fetch_failure(&outcome.block_id, now)
                .map(|_| ()),
        };
        if let Err(err) = applied {
            // Definitions were reloaded while the fetch was in flight.
            log::debug!(target: "content_blocks",
                        block_id:display = outcome.block_id;
                        "dropping fetch outcome: {err}");
        }
    }

    /// Fetch what `placeholder_key` needs, select a block, normalize and measure it, and make its
    /// render session the active one of the placeholder.
    ///
    /// Returns `None` when there is nothing to show. The placeholder is collapsed in that case:
    /// its render sessions are deactivated and their heights reset.
    pub async fn prepare(&mut self, placeholder_key: &str) -> Option<PreparedContent> {
        let fetched: HashMap<String, f32> = self
            .ensure_fresh(placeholder_key)
            .await
            .into_iter()
            .filter(|outcome| outcome.error.is_none())
            .map(|outcome| (outcome.block_id, outcome.height))
            .collect();

        let Some((block_id, normalized)) = self.select_normalized(placeholder_key) else {
            self.collapse(placeholder_key);
            return None;
        };

        let tag = match self.sessions.tag_for(placeholder_key, &block_id) {
            Some(tag) => tag,
            None => self.sessions.begin(placeholder_key, block_id.as_str(), 0),
        };
        // The block is known: it was just selected from the registry.
        let _ = self.registry.add_tag(&block_id, tag);
        if fetched.contains_key(&block_id) {
            // New payload, the previous measurement no longer applies.
            let _ = self.sessions.reset_height(tag);
        }

        let measured = self
            .sessions
            .get(tag)
            .map(|session| session.measured_height)
            .filter(|height| *height > 0.0);
        let height = match measured {
            // Reused session, already measured.
            Some(height) => height,
            None => {
                let height = match fetched.get(&block_id) {
                    Some(height) if *height > 0.0 => *height,
                    _ => self.measure(&block_id, placeholder_key, &normalized.html).await,
                };
                if height <= 0.0 {
                    log::warn!(target: "content_blocks",
                               block_id,
                               placeholder_key;
                               "content could not be measured, collapsing placeholder");
                    self.collapse(placeholder_key);
                    return None;
                }
                if let Err(err) = self.report_height(tag, height) {
                    log::warn!(target: "content_blocks", tag:display = tag; "{err}");
                    return None;
                }
                height
            }
        };
        if let Err(err) = self.sessions.activate(tag) {
            log::warn!(target: "content_blocks", tag:display = tag; "{err}");
            return None;
        }

        Some(PreparedContent {
            tag,
            placeholder_key: placeholder_key.to_owned(),
            block_id,
            html: normalized.html,
            actions: normalized.actions,
            height,
        })
    }

    /// Select a block and get its normalized HTML, excluding blocks whose static content fails
    /// normalization until one passes or nothing is left.
    fn select_normalized(&mut self, placeholder_key: &str) -> Option<(String, NormalizedHtml)> {
        loop {
            let now = self.clock.now();
            let block =
                self.registry
                    .resolve(placeholder_key, &self.statuses, now, &mut self.rng)?;
            let block_id = block.id.clone();

            let normalized = match (&block.raw_content, &block.personalization) {
                (Some(raw), _) => self.normalizer.normalize(raw),
                (None, Some(personalization)) => personalization
                    .html_payload
                    .clone()
                    .ok_or_else(|| Error::CorruptedContent("missing payload".to_owned())),
                (None, None) => Err(Error::CorruptedContent("unresolved block".to_owned())),
            };

            match normalized {
                Ok(normalized) => return Some((block_id, normalized)),
                Err(err) => {
                    log::warn!(target: "content_blocks",
                               block_id,
                               placeholder_key;
                               "excluding content block: {err}");
                    let _ = self.registry.mark_corrupted(&block_id);
                    self.track_error(&block_id, placeholder_key, Some(&err));
                }
            }
        }
    }

    async fn measure(&self, block_id: &str, placeholder_key: &str, html: &str) -> f32 {
        match self.coordinator.enqueue_static(block_id, placeholder_key, html) {
            Ok(pending) => {
                let outcome = pending.await;
                if let Some(err) = &outcome.error {
                    log::warn!(target: "content_blocks",
                               block_id;
                               "measurement failed: {err}");
                }
                outcome.height
            }
            Err(err) => {
                log::warn!(target: "content_blocks",
                           block_id;
                           "unable to queue measurement: {err}");
                0.0
            }
        }
    }

    fn collapse(&mut self, placeholder_key: &str) {
        let collapsed = self.sessions.collapse(placeholder_key);
        log::debug!(target: "content_blocks",
                    placeholder_key,
                    sessions = collapsed.len();
                    "collapsed placeholder");
    }

    /// Record the height measured by the renderer of `tag`. Returns the tag of the session that
    /// holds the height, which differs from `tag` when the session was already measured.
    ///
    /// # Errors
    ///
    /// [`Error::StaleRenderSession`] if `tag` was released.
    pub fn report_height(&mut self, tag: RenderTag, height: f32) -> Result<RenderTag> {
        let target = self.sessions.report_height(tag, height).map_err(|err| {
            log::warn!(target: "content_blocks",
                       tag:display = tag;
                       "height reported for a stale render session");
            err
        })?;
        if target != tag {
            if let Some(block_id) = self.sessions.get(target).map(|s| s.block_id.clone()) {
                self.registry.add_tag(&block_id, target)?;
            }
        }
        Ok(target)
    }

    /// Make `tag` the only active session of its placeholder.
    pub fn activate(&mut self, tag: RenderTag) -> Result<()> {
        self.sessions.activate(tag)
    }

    /// The renderer behind `tag` was destroyed. Returns `false` if the session was already gone.
    pub fn release_session(&mut self, tag: RenderTag) -> bool {
        let released = self.sessions.release(tag).is_some();
        if released {
            self.registry.remove_tag(tag);
        }
        released
    }

    /// Activate `tag` and record its block as displayed.
    pub fn display_session(&mut self, tag: RenderTag) -> Result<()> {
        self.sessions.activate(tag)?;
        let session = self
            .sessions
            .get(tag)
            .ok_or(Error::StaleRenderSession(tag))?;
        let (block_id, placeholder_key) = (session.block_id.clone(), session.placeholder_key.clone());
        self.report_displayed(&block_id, &placeholder_key)
    }

    /// Record that `block_id` was displayed in `placeholder_key` and track it.
    pub fn report_displayed(&mut self, block_id: &str, placeholder_key: &str) -> Result<()> {
        let now = self.clock.now();
        let block = self
            .registry
            .get(block_id)
            .ok_or_else(|| Error::UnknownBlock(block_id.to_owned()))?;
        self.statuses.did_display(block_id, now);
        self.tracking_sink.track(ContentBlockEvent::new(
            TrackingAction::Show,
            placeholder_key,
            block,
            now,
        ));
        Ok(())
    }

    /// Record a user action on `block_id` and track it. Clicks and closes count as interactions.
    pub fn report_interacted(
        &mut self,
        block_id: &str,
        placeholder_key: &str,
        action: TrackingAction,
    ) -> Result<()> {
        let now = self.clock.now();
        let block = self
            .registry
            .get(block_id)
            .ok_or_else(|| Error::UnknownBlock(block_id.to_owned()))?;
        if action.is_interaction() {
            self.statuses.did_interact(block_id, now);
        }
        self.tracking_sink
            .track(ContentBlockEvent::new(action, placeholder_key, block, now));
        Ok(())
    }

    /// Track that `block_id` could not be shown.
    pub fn report_error(
        &mut self,
        block_id: &str,
        placeholder_key: &str,
        message: impl Into<String>,
    ) -> Result<()> {
        self.report_interacted(
            block_id,
            placeholder_key,
            TrackingAction::Error {
                message: message.into(),
            },
        )
    }

    fn track_error(&self, block_id: &str, placeholder_key: &str, err: Option<&Error>) {
        if let Some(block) = self.registry.get(block_id) {
            let message = err
                .map(|err| err.to_string())
                .unwrap_or_else(|| "corrupted content".to_owned());
            self.tracking_sink.track(ContentBlockEvent::new(
                TrackingAction::Error { message },
                placeholder_key,
                block,
                self.clock.now(),
            ));
        }
    }

    /// Forget everything tied to the current customer: personalization, render sessions and
    /// display statuses. Static definitions are kept.
    pub fn anonymize(&mut self) {
        self.registry.invalidate_all();
        self.sessions.clear();
        self.statuses.clear();
        log::debug!(target: "content_blocks", "anonymized content blocks");
    }

    /// Create a carousel driven by the engine's clock.
    pub fn new_carousel(&self) -> CarouselRotation {
        CarouselRotation::new(self.carousel, self.clock.clone())
    }

    /// Items for a carousel in `placeholder_key`: every showable block ordered by priority
    /// descending then name, truncated to the configured maximum.
    pub fn carousel_items(&mut self, placeholder_key: &str) -> Vec<CarouselItem> {
        let now = self.clock.now();
        let ctx = SelectionContext {
            placeholder_key,
            now,
            statuses: &self.statuses,
        };
        let mut blocks = priority::eligible(self.registry.candidates(placeholder_key), &ctx);
        priority::carousel_order(&mut blocks);

        let mut items = Vec::new();
        let mut corrupted = Vec::new();
        for block in blocks {
            let html = match &block.raw_content {
                Some(raw) => match self.normalizer.normalize(raw) {
                    Ok(normalized) => normalized.html,
                    Err(err) => {
                        corrupted.push((block.id.clone(), err));
                        continue;
                    }
                },
                None => match block.html() {
                    Some(html) => html.to_owned(),
                    None => continue,
                },
            };
            items.push(CarouselItem {
                block_id: block.id.clone(),
                name: block.name.clone(),
                priority: block.priority,
                html,
            });
        }

        for (block_id, err) in corrupted {
            log::warn!(target: "content_blocks",
                       block_id,
                       placeholder_key;
                       "excluding content block: {err}");
            let _ = self.registry.mark_corrupted(&block_id);
            self.track_error(&block_id, placeholder_key, Some(&err));
        }

        if self.carousel.max_items > 0 {
            items.truncate(self.carousel.max_items);
        }
        items
    }

    /// Decide what to do with a carousel item that just finished displaying.
    pub fn check_carousel_item(&mut self, block_id: &str) -> CarouselItemCheck {
        let now = self.clock.now();
        let Some(block) = self.registry.get(block_id) else {
            return CarouselItemCheck::Invalid;
        };

        let status = self.statuses.status_of(block_id);
        let date_allowed = block.date_filter.map_or(true, |filter| filter.allows(now));
        if !date_allowed || !is_eligible(&block.frequency_policy, &status, block.session_start) {
            return CarouselItemCheck::Invalid;
        }

        if self.registry.is_expired(block_id, now) {
            let _ = self.registry.mark_needs_refresh(block_id);
            return CarouselItemCheck::NeedsRefresh;
        }
        CarouselItemCheck::Valid
    }

    /// Stop the fetch worker after it drains the requests already queued.
    pub async fn shutdown(self) {
        let ContentBlocksEngine {
            coordinator,
            worker,
            ..
        } = self;
        drop(coordinator);
        if let Err(err) = worker.await {
            log::warn!(target: "content_blocks", "fetch worker ended abnormally: {err}");
        }
    }
}
