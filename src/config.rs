use std::{sync::Arc, time::Duration};

use crate::{
    carousel::CarouselConfig,
    clock::{Clock, SystemClock},
    coordinator::CoordinatorConfig,
    display_status::{DisplayStatusStore, MemoryStorage, StatusStorage},
    engine::ContentBlocksEngine,
    fetcher::PersonalizationFetcher,
    render::{HeightMeasurer, HtmlNormalizer, PassthroughNormalizer},
    tracking::{NoopTrackingSink, TrackingSink},
};

/// Configuration for [`ContentBlocksEngine`].
pub struct EngineConfig {
    pub(crate) max_fetch_queue_len: usize,
    pub(crate) measurement_timeout: Duration,
    pub(crate) status_retention: Duration,
    pub(crate) carousel: CarouselConfig,
    pub(crate) tracking_sink: Box<dyn TrackingSink>,
    pub(crate) status_storage: Box<dyn StatusStorage>,
    pub(crate) normalizer: Arc<dyn HtmlNormalizer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rng_seed: Option<u64>,
}

impl EngineConfig {
    /// Default value for [`EngineConfig::with_max_fetch_queue_len`].
    pub const DEFAULT_MAX_FETCH_QUEUE_LEN: usize = CoordinatorConfig::DEFAULT_MAX_QUEUE_LEN;
    /// Default value for [`EngineConfig::with_measurement_timeout`].
    pub const DEFAULT_MEASUREMENT_TIMEOUT: Duration = CoordinatorConfig::DEFAULT_MEASUREMENT_TIMEOUT;
    /// Default value for [`EngineConfig::with_status_retention`].
    pub const DEFAULT_STATUS_RETENTION: Duration = DisplayStatusStore::DEFAULT_RETENTION;

    /// Create a default configuration: in-memory display statuses, pass-through normalization,
    /// wall-clock time and no tracking.
    ///
    /// ```
    /// # use content_blocks::EngineConfig;
    /// let config = EngineConfig::new().with_max_fetch_queue_len(16);
    /// ```
    pub fn new() -> EngineConfig {
        EngineConfig {
            max_fetch_queue_len: EngineConfig::DEFAULT_MAX_FETCH_QUEUE_LEN,
            measurement_timeout: EngineConfig::DEFAULT_MEASUREMENT_TIMEOUT,
            status_retention: EngineConfig::DEFAULT_STATUS_RETENTION,
            carousel: CarouselConfig::default(),
            tracking_sink: Box::new(NoopTrackingSink),
            status_storage: Box::new(MemoryStorage::default()),
            normalizer: Arc::new(PassthroughNormalizer),
            clock: Arc::new(SystemClock),
            rng_seed: None,
        }
    }

    /// Number of fetch requests that may wait behind the one in flight. Requests beyond it are
    /// rejected.
    pub fn with_max_fetch_queue_len(mut self, max_fetch_queue_len: usize) -> EngineConfig {
        self.max_fetch_queue_len = max_fetch_queue_len;
        self
    }

    /// Longest a height measurement may take before the placeholder collapses.
    pub fn with_measurement_timeout(mut self, measurement_timeout: Duration) -> EngineConfig {
        self.measurement_timeout = measurement_timeout;
        self
    }

    /// Display statuses untouched for longer are dropped on startup.
    pub fn with_status_retention(mut self, status_retention: Duration) -> EngineConfig {
        self.status_retention = status_retention;
        self
    }

    /// Settings of carousels created by the engine.
    pub fn with_carousel(mut self, carousel: CarouselConfig) -> EngineConfig {
        self.carousel = carousel;
        self
    }

    /// Set a tracking sink to pass content block events to your analytics pipeline.
    ///
    /// ```
    /// # use content_blocks::{ContentBlockEvent, EngineConfig};
    /// let config = EngineConfig::new().with_tracking_sink(|event: ContentBlockEvent| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn with_tracking_sink(mut self, tracking_sink: impl TrackingSink + 'static) -> EngineConfig {
        self.tracking_sink = Box::new(tracking_sink);
        self
    }

    /// Where display statuses are persisted.
    pub fn with_status_storage(
        mut self,
        status_storage: impl StatusStorage + 'static,
    ) -> EngineConfig {
        self.status_storage = Box::new(status_storage);
        self
    }

    /// Replace the default [`PassthroughNormalizer`](crate::PassthroughNormalizer).
    pub fn with_normalizer(mut self, normalizer: impl HtmlNormalizer + 'static) -> EngineConfig {
        self.normalizer = Arc::new(normalizer);
        self
    }

    /// Use another time source, e.g., a [`ManualClock`](crate::ManualClock) in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> EngineConfig {
        self.clock = clock;
        self
    }

    /// Seed the random tie-breaking between blocks of equal priority.
    pub fn with_rng_seed(mut self, seed: u64) -> EngineConfig {
        self.rng_seed = Some(seed);
        self
    }

    pub(crate) fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_queue_len: self.max_fetch_queue_len,
            measurement_timeout: self.measurement_timeout,
        }
    }

    /// Create a [`ContentBlocksEngine`] using this configuration. Must be called from within a
    /// tokio runtime since it spawns the fetch worker.
    pub fn start<F, M>(self, fetcher: F, measurer: M) -> ContentBlocksEngine
    where
        F: PersonalizationFetcher,
        M: HeightMeasurer,
    {
        ContentBlocksEngine::start(self, fetcher, measurer)
    }
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig::new()
    }
}
