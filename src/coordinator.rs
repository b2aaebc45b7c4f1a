//! Serialized fetch-and-measure cycles.
//!
//! A single worker task owns the [`PersonalizationFetcher`] and the [`HeightMeasurer`], and
//! drains a bounded FIFO channel of jobs. Because the worker is the only place either
//! collaborator is driven from, at most one fetch/measure cycle is ever in flight, and the
//! renderer used for measurement is never raced.
//!
//! Every accepted job is answered exactly once through its [`PendingFetch`], with a failure
//! outcome if the fetch or the measurement failed, or if the worker went away.
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    clock::Clock,
    fetcher::PersonalizationFetcher,
    models::Personalization,
    render::{HeightMeasurer, HtmlNormalizer},
    Error,
};

/// Settings of [`FetchCoordinator`].
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Jobs that may wait behind the one in flight.
    pub max_queue_len: usize,
    /// Longest a single height measurement may take.
    pub measurement_timeout: Duration,
}

impl CoordinatorConfig {
    /// Default value for [`CoordinatorConfig::max_queue_len`].
    pub const DEFAULT_MAX_QUEUE_LEN: usize = 64;
    /// Default value for [`CoordinatorConfig::measurement_timeout`].
    pub const DEFAULT_MEASUREMENT_TIMEOUT: Duration = Duration::from_secs(5);
}

impl Default for CoordinatorConfig {
    fn default() -> CoordinatorConfig {
        CoordinatorConfig {
            max_queue_len: CoordinatorConfig::DEFAULT_MAX_QUEUE_LEN,
            measurement_timeout: CoordinatorConfig::DEFAULT_MEASUREMENT_TIMEOUT,
        }
    }
}

/// A request to resolve (and measure) one block for one placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Block to fetch.
    pub block_id: String,
    /// Placeholder the block is measured for.
    pub placeholder_key: String,
    /// Already known, normalized HTML. When set, the fetch is skipped and only the measurement
    /// runs.
    pub static_html: Option<String>,
}

/// Result of one fetch/measure cycle.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    #[allow(missing_docs)]
    pub block_id: String,
    #[allow(missing_docs)]
    pub placeholder_key: String,
    /// Fetched payload, if the server answered for the block.
    pub personalization: Option<Personalization>,
    /// Measured height. `0.0` when nothing could be measured, which collapses the placeholder.
    pub height: f32,
    /// What went wrong, if anything.
    pub error: Option<Error>,
}

impl FetchOutcome {
    fn new(request: &FetchRequest) -> FetchOutcome {
        FetchOutcome {
            block_id: request.block_id.clone(),
            placeholder_key: request.placeholder_key.clone(),
            personalization: None,
            height: 0.0,
            error: None,
        }
    }

    fn failed(block_id: String, placeholder_key: String, error: Error) -> FetchOutcome {
        FetchOutcome {
            block_id,
            placeholder_key,
            personalization: None,
            height: 0.0,
            error: Some(error),
        }
    }

    /// Return `true` if the personalization could not be obtained. Measurement problems alone do
    /// not count: the payload is still valid.
    pub fn is_fetch_failure(&self) -> bool {
        self.error.as_ref().is_some_and(|err| {
            err.is_fetch_failure() || matches!(err, Error::CoordinatorStopped)
        })
    }
}

struct Job {
    request: FetchRequest,
    respond_to: oneshot::Sender<FetchOutcome>,
}

/// Completion of an enqueued request. Resolves exactly once.
#[derive(Debug)]
pub struct PendingFetch {
    block_id: String,
    placeholder_key: String,
    receiver: oneshot::Receiver<FetchOutcome>,
}

impl PendingFetch {
    /// Block the pending job was submitted for.
    pub fn block_id(&self) -> &str {
        &self.block_id
    }
}

impl Future for PendingFetch {
    type Output = FetchOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<FetchOutcome> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Worker dropped the job (stopped or panicked).
            Poll::Ready(Err(_)) => Poll::Ready(FetchOutcome::failed(
                self.block_id.clone(),
                self.placeholder_key.clone(),
                Error::CoordinatorStopped,
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle to the fetch worker. Dropping every handle lets the worker drain the queue and exit.
#[derive(Debug, Clone)]
pub struct FetchCoordinator {
    jobs: mpsc::Sender<Job>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
}

impl FetchCoordinator {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start<F, M>(
        fetcher: F,
        measurer: M,
        normalizer: Arc<dyn HtmlNormalizer>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> (FetchCoordinator, JoinHandle<()>)
    where
        F: PersonalizationFetcher,
        M: HeightMeasurer,
    {
        let capacity = config.max_queue_len.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            fetcher,
            measurer,
            normalizer,
            clock,
            measurement_timeout: config.measurement_timeout,
            pending: pending.clone(),
        };
        let join_handle = tokio::spawn(worker.run(receiver));

        (
            FetchCoordinator {
                jobs: sender,
                pending,
                capacity,
            },
            join_handle,
        )
    }

    /// Queue a personalization fetch for `block_id`, followed by a measurement of its payload.
    ///
    /// # Errors
    ///
    /// - [`Error::FetchQueueFull`] if the configured bound is reached.
    /// - [`Error::CoordinatorStopped`] if the worker is gone.
    pub fn enqueue(
        &self,
        block_id: impl Into<String>,
        placeholder_key: impl Into<String>,
    ) -> crate::Result<PendingFetch> {
        self.submit(FetchRequest {
            block_id: block_id.into(),
            placeholder_key: placeholder_key.into(),
            static_html: None,
        })
    }

    /// Queue a measurement of already normalized HTML. It shares the queue with fetches since it
    /// drives the same renderer.
    pub fn enqueue_static(
        &self,
        block_id: impl Into<String>,
        placeholder_key: impl Into<String>,
        html: impl Into<String>,
    ) -> crate::Result<PendingFetch> {
        self.submit(FetchRequest {
            block_id: block_id.into(),
            placeholder_key: placeholder_key.into(),
            static_html: Some(html.into()),
        })
    }

    /// Submit `request`.
    ///
    /// # Errors
    ///
    /// See [`FetchCoordinator::enqueue`].
    pub fn submit(&self, request: FetchRequest) -> crate::Result<PendingFetch> {
        let (respond_to, receiver) = oneshot::channel();
        let pending = PendingFetch {
            block_id: request.block_id.clone(),
            placeholder_key: request.placeholder_key.clone(),
            receiver,
        };

        // Counted before sending: the worker may finish the job before `try_send` returns.
        self.pending.fetch_add(1, Ordering::SeqCst);
        let sent = self.jobs.try_send(Job {
            request,
            respond_to,
        });
        if sent.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }

        match sent {
            Ok(()) => Ok(pending),
            Err(mpsc::error::TrySendError::Full(job)) => {
                log::warn!(target: "content_blocks",
                           block_id:display = job.request.block_id,
                           capacity = self.capacity;
                           "fetch queue is full, rejecting request");
                Err(Error::FetchQueueFull {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::CoordinatorStopped),
        }
    }

    /// Accepted requests that have not completed yet, the one in flight included.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Return `true` if no request is queued or running.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

struct Worker<F, M> {
    fetcher: F,
    measurer: M,
    normalizer: Arc<dyn HtmlNormalizer>,
    clock: Arc<dyn Clock>,
    measurement_timeout: Duration,
    pending: Arc<AtomicUsize>,
}

impl<F: PersonalizationFetcher, M: HeightMeasurer> Worker<F, M> {
    async fn run(self, mut jobs: mpsc::Receiver<Job>) {
        log::debug!(target: "content_blocks", "fetch worker started");
        while let Some(job) = jobs.recv().await {
            let outcome = self.process(&job.request).await;
            // The caller may have stopped waiting, which is fine.
            let _ = job.respond_to.send(outcome);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        log::debug!(target: "content_blocks", "fetch worker stopped");
    }

    async fn process(&self, request: &FetchRequest) -> FetchOutcome {
        log::debug!(target: "content_blocks",
                    block_id:display = request.block_id,
                    placeholder_key:display = request.placeholder_key;
                    "starting fetch cycle");
        let mut outcome = FetchOutcome::new(request);

        let html = match &request.static_html {
            Some(html) => html.clone(),
            None => {
                let personalization = match self.fetch(&request.block_id).await {
                    Ok(personalization) => personalization,
                    Err(err) => {
                        log::warn!(target: "content_blocks",
                                   block_id:display = request.block_id;
                                   "personalization fetch failed: {err}");
                        outcome.error = Some(err);
                        return outcome;
                    }
                };
                let html = personalization
                    .html_payload
                    .as_ref()
                    .filter(|_| personalization.is_showable())
                    .map(|payload| payload.html.clone());
                if personalization.corrupted {
                    outcome.error = Some(Error::CorruptedContent(format!(
                        "personalized content of {} failed normalization",
                        request.block_id
                    )));
                }
                outcome.personalization = Some(personalization);
                match html {
                    Some(html) => html,
                    // Nothing to show, nothing to measure.
                    None => return outcome,
                }
            }
        };

        match tokio::time::timeout(self.measurement_timeout, self.measurer.measure(&html)).await {
            Ok(Ok(height)) if height.is_finite() && height >= 0.0 => outcome.height = height,
            Ok(Ok(height)) => {
                log::warn!(target: "content_blocks",
                           block_id:display = request.block_id;
                           "renderer reported an invalid height: {height}");
                outcome.error = Some(Error::RenderMeasurementFailed(format!(
                    "invalid height {height}"
                )));
            }
            Ok(Err(err)) => {
                log::warn!(target: "content_blocks",
                           block_id:display = request.block_id;
                           "height measurement failed: {err}");
                outcome.error = Some(err);
            }
            Err(_elapsed) => {
                log::warn!(target: "content_blocks",
                           block_id:display = request.block_id,
                           timeout:debug = self.measurement_timeout;
                           "height measurement timed out");
                outcome.error = Some(Error::RenderMeasurementTimeout);
            }
        }

        log::debug!(target: "content_blocks",
                    block_id:display = request.block_id,
                    height = outcome.height;
                    "finished fetch cycle");
        outcome
    }

    async fn fetch(&self, block_id: &str) -> crate::Result<Personalization> {
        let block_ids = [block_id.to_owned()];
        let mut fetched = self.fetcher.fetch_personalization(&block_ids).await?;
        let block = fetched.remove(block_id).ok_or_else(|| {
            Error::FetchFailed(format!("no personalization returned for {block_id}"))
        })?;
        Ok(block.into_personalization(&*self.normalizer, self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use chrono::Utc;

    use super::{CoordinatorConfig, FetchCoordinator};
    use crate::{
        clock::{Clock, SystemClock},
        fetcher::PersonalizationFetcher,
        models::{Content, PersonalizationStatus, PersonalizedContentBlock},
        render::{FixedHeightMeasurer, HeightMeasurer, PassthroughNormalizer},
        Error, Result,
    };

    #[derive(Clone, Default)]
    struct RecordingFetcher {
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl PersonalizationFetcher for RecordingFetcher {
        async fn fetch_personalization(
            &self,
            block_ids: &[String],
        ) -> Result<HashMap<String, PersonalizedContentBlock>> {
            self.calls.lock().unwrap().extend(block_ids.iter().cloned());
            // Give queued callers a chance to run while a cycle is in flight.
            tokio::task::yield_now().await;
            if self.fail {
                return Err(Error::FetchFailed("server unavailable".to_owned()));
            }
            Ok(block_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        PersonalizedContentBlock {
                            id: id.clone(),
                            status: PersonalizationStatus::Ok,
                            ttl_seconds: 60,
                            variant_id: None,
                            variant_name: None,
                            has_tracking_consent: None,
                            content: Some(Content {
                                html: format!("<p>{id}</p>"),
                            }),
                        },
                    )
                })
                .collect())
        }
    }

    struct SlowMeasurer;

    impl HeightMeasurer for SlowMeasurer {
        async fn measure(&self, _html: &str) -> Result<f32> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(100.0)
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    #[tokio::test]
    async fn drains_fifo_even_when_every_fetch_fails() {
        let _ = env_logger::builder().is_test(true).try_init();
        let fetcher = RecordingFetcher {
            fail: true,
            ..Default::default()
        };
        let (coordinator, _worker) = FetchCoordinator::start(
            fetcher.clone(),
            FixedHeightMeasurer(50.0),
            Arc::new(PassthroughNormalizer),
            clock(),
            CoordinatorConfig::default(),
        );

        let ids: Vec<String> = (0..5).map(|i| format!("block-{i}")).collect();
        let pending: Vec<_> = ids
            .iter()
            .map(|id| coordinator.enqueue(id.clone(), "p1").unwrap())
            .collect();
        assert_eq!(coordinator.pending(), 5);

        let mut completed = Vec::new();
        for pending in pending {
            let outcome = pending.await;
            assert!(outcome.is_fetch_failure());
            assert_eq!(outcome.height, 0.0);
            completed.push(outcome.block_id);
        }

        assert_eq!(completed, ids);
        assert_eq!(*fetcher.calls.lock().unwrap(), ids);
        assert!(coordinator.is_idle());
    }

    #[tokio::test]
    async fn successful_cycle_measures_payload() {
        let (coordinator, _worker) = FetchCoordinator::start(
            RecordingFetcher::default(),
            FixedHeightMeasurer(42.0),
            Arc::new(PassthroughNormalizer),
            clock(),
            CoordinatorConfig::default(),
        );

        let outcome = coordinator.enqueue("a", "p1").unwrap().await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.height, 42.0);
        let personalization = outcome.personalization.unwrap();
        assert!(personalization.is_showable());
        assert!(personalization.ttl_observed_at <= Utc::now());
    }

    #[tokio::test]
    async fn rejects_requests_beyond_the_bound() {
        let (coordinator, _worker) = FetchCoordinator::start(
            RecordingFetcher::default(),
            FixedHeightMeasurer(1.0),
            Arc::new(PassthroughNormalizer),
            clock(),
            CoordinatorConfig {
                max_queue_len: 2,
                ..Default::default()
            },
        );

        // The worker has not run yet on this single-threaded runtime.
        let first = coordinator.enqueue("a", "p1").unwrap();
        let second = coordinator.enqueue("b", "p1").unwrap();
        assert!(matches!(
            coordinator.enqueue("c", "p1"),
            Err(Error::FetchQueueFull { capacity: 2 })
        ));
        // Rejected requests are not counted.
        assert_eq!(coordinator.pending(), 2);

        assert_eq!(first.await.block_id, "a");
        assert_eq!(second.await.block_id, "b");
        assert!(coordinator.enqueue("c", "p1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn measurement_timeout_yields_zero_height() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (coordinator, _worker) = FetchCoordinator::start(
            RecordingFetcher::default(),
            SlowMeasurer,
            Arc::new(PassthroughNormalizer),
            clock(),
            CoordinatorConfig::default(),
        );

        let outcome = coordinator.enqueue("a", "p1").unwrap().await;

        assert!(matches!(outcome.error, Some(Error::RenderMeasurementTimeout)));
        assert_eq!(outcome.height, 0.0);
        // The payload itself is still usable.
        assert!(outcome.personalization.is_some());
        assert!(!outcome.is_fetch_failure());
    }

    #[tokio::test]
    async fn invalid_height_is_a_measurement_failure() {
        let (coordinator, _worker) = FetchCoordinator::start(
            RecordingFetcher::default(),
            FixedHeightMeasurer(f32::NAN),
            Arc::new(PassthroughNormalizer),
            clock(),
            CoordinatorConfig::default(),
        );

        let outcome = coordinator.enqueue("a", "p1").unwrap().await;

        assert!(matches!(
            outcome.error,
            Some(Error::RenderMeasurementFailed(_))
        ));
        assert_eq!(outcome.height, 0.0);
        assert!(outcome.personalization.is_some());
        assert!(!outcome.is_fetch_failure());
    }

    #[tokio::test]
    async fn static_html_skips_the_fetch() {
        let fetcher = RecordingFetcher::default();
        let (coordinator, _worker) = FetchCoordinator::start(
            fetcher.clone(),
            FixedHeightMeasurer(10.0),
            Arc::new(PassthroughNormalizer),
            clock(),
            CoordinatorConfig::default(),
        );

        let measured = coordinator
            .enqueue_static("a", "p1", "<p>a</p>")
            .unwrap()
            .await;

        assert_eq!(measured.height, 10.0);
        assert!(measured.error.is_none());
        assert!(measured.personalization.is_none());
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_fetch_resolves_when_worker_is_gone() {
        let (coordinator, worker) = FetchCoordinator::start(
            RecordingFetcher::default(),
            FixedHeightMeasurer(10.0),
            Arc::new(PassthroughNormalizer),
            clock(),
            CoordinatorConfig::default(),
        );
        worker.abort();
        let _ = worker.await;

        match coordinator.enqueue("a", "p1") {
            Err(Error::CoordinatorStopped) => assert_eq!(coordinator.pending(), 0),
            Ok(pending) => assert!(matches!(
                pending.await.error,
                Some(Error::CoordinatorStopped)
            )),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
}
