//! Content block selection, caching and delivery coordination.
//!
//! # Overview
//!
//! The crate decides, for a given UI placeholder, which server-delivered content block (if any)
//! should be shown. It revolves around a [`ContentBlocksEngine`] created from an
//! [`EngineConfig`]. The engine keeps the known block definitions in a [`ContentBlockRegistry`],
//! filters them by frequency policy, date window and priority, fetches personalized payloads when
//! they are missing or their TTL expired, and measures rendered HTML before it is shown.
//!
//! Fetching and measuring go through a [`FetchCoordinator`] that runs at most one
//! fetch-and-measure cycle at a time and answers every accepted request exactly once.
//!
//! Hosts plug in their own collaborators:
//! - [`PersonalizationFetcher`] obtains personalized payloads ([`HttpFetcher`] talks to the HTTP
//!   API).
//! - [`HeightMeasurer`] renders HTML and reports its height.
//! - [`HtmlNormalizer`] sanitizes HTML before it reaches any renderer.
//! - [`TrackingSink`] receives display and interaction events.
//! - [`StatusStorage`] persists display statuses.
//! - [`Clock`] provides the current instant.
//!
//! Carousel placeholders are driven by a [`CarouselRotation`] state machine.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Fetch and measurement failures never reach the UI as errors: they are absorbed by the engine
//! and surface as "no content" or "stale content retained one more cycle". "Nothing to show" is
//! not an error either; selection returns `None`.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages
//! under the `content_blocks` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into engine operations.
//!
//! # Examples
//!
//! Examples can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod carousel;
pub mod clock;
pub mod coordinator;
pub mod display_status;
pub mod fetcher;
pub mod frequency;
pub mod models;
pub mod priority;
pub mod registry;
pub mod render;
pub mod render_session;
pub mod tracking;

mod config;
mod engine;
mod error;

pub use carousel::{CarouselConfig, CarouselEvent, CarouselItem, CarouselRotation, CarouselState};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::EngineConfig;
pub use coordinator::{FetchCoordinator, FetchOutcome, PendingFetch};
pub use display_status::{DisplayStatus, DisplayStatusStore, JsonFileStorage, StatusStorage};
pub use engine::{CarouselItemCheck, ContentBlocksEngine, PreparedContent};
pub use error::{Error, Result};
pub use fetcher::{HttpFetcher, HttpFetcherConfig, PersonalizationFetcher};
pub use models::{ContentBlockDefinition, FrequencyPolicy, Personalization};
pub use registry::{BlockState, ContentBlockRegistry};
pub use render::{FixedHeightMeasurer, HeightMeasurer, HtmlNormalizer, PassthroughNormalizer};
pub use render_session::{RenderSessionTracker, RenderTag};
pub use tracking::{ContentBlockEvent, TrackingAction, TrackingSink};
