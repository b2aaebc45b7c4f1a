//! Timer-driven rotation of carousel placeholders.
//!
//! [`CarouselRotation`] does not own a real timer. It keeps the instant its timer would fire and
//! the host drives it by calling [`CarouselRotation::tick`] (or [`CarouselRotation::on_timer_fired`]
//! from its own timer), so the machine stays deterministic under a [`ManualClock`].
//!
//! [`ManualClock`]: crate::clock::ManualClock
use std::{collections::HashSet, sync::Arc, time::Duration};

use serde::Serialize;

use crate::clock::{after, elapsed, to_delta, Clock, Timestamp};

/// Last transition of a carousel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CarouselState {
    /// Created, nothing shown yet.
    Idle,
    /// Rotation timer armed.
    StartTimer,
    /// Rotation timer disarmed.
    StopTimer,
    /// The item list changed.
    Refresh,
    /// Advanced to the next item; the host swaps the rendered page.
    ShouldReload,
    /// Rotation restarted from a clean timer.
    Restart,
}

/// Settings of a carousel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarouselConfig {
    /// Time each item stays visible. Zero disables automatic rotation.
    pub interval: Duration,
    /// Upper bound of items shown. Zero means unlimited.
    pub max_items: usize,
}

impl CarouselConfig {
    /// Default value for [`CarouselConfig::interval`].
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
    /// Default value for [`CarouselConfig::max_items`].
    pub const DEFAULT_MAX_ITEMS: usize = 0;

    /// Config with the default interval and no item limit.
    pub fn new() -> CarouselConfig {
        CarouselConfig::default()
    }

    /// Set how long each item stays visible.
    pub fn with_interval(mut self, interval: Duration) -> CarouselConfig {
        self.interval = interval;
        self
    }

    /// Cap the number of items. `0` means unlimited.
    pub fn with_max_items(mut self, max_items: usize) -> CarouselConfig {
        self.max_items = max_items;
        self
    }
}

impl Default for CarouselConfig {
    fn default() -> CarouselConfig {
        CarouselConfig {
            interval: CarouselConfig::DEFAULT_INTERVAL,
            max_items: CarouselConfig::DEFAULT_MAX_ITEMS,
        }
    }
}

/// A block displayed by the carousel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarouselItem {
    #[allow(missing_docs)]
    pub block_id: String,
    #[allow(missing_docs)]
    pub name: String,
    /// Items are ordered by descending priority, then by name.
    pub priority: i64,
    /// Normalized HTML to render.
    pub html: String,
}

/// Notification sent to carousel listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CarouselEvent {
    /// The carousel moved to a new state.
    StateChanged(CarouselState),
    /// The item list was reloaded or an item was removed.
    ItemsChanged {
        /// Number of items after the change.
        count: usize,
        /// Items after the change, in display order.
        items: Vec<CarouselItem>,
    },
    /// An item finished displaying. Always reported before the next [`CarouselEvent::ItemShown`].
    ItemHidden {
        /// Position the item had when it was hidden.
        index: usize,
        /// Block behind the hidden item.
        block_id: String,
    },
    /// An item became visible.
    ItemShown {
        /// Position of the shown item.
        index: usize,
        /// Block behind the shown item.
        block_id: String,
        /// First display since the last reload.
        first_time: bool,
    },
}

type Listener = Box<dyn Fn(&CarouselEvent) + Send + Sync>;

/// Rotation state machine of one carousel view.
pub struct CarouselRotation {
    config: CarouselConfig,
    clock: Arc<dyn Clock>,
    items: Vec<CarouselItem>,
    index: usize,
    state: CarouselState,
    /// Instant the armed timer fires at.
    deadline: Option<Timestamp>,
    last_advance: Timestamp,
    /// Time already spent on the current item when the timer was stopped.
    saved_elapsed: Option<Duration>,
    shown_since_reload: HashSet<String>,
    listeners: Vec<Listener>,
}

impl CarouselRotation {
    /// Create an idle carousel with no items.
    pub fn new(config: CarouselConfig, clock: Arc<dyn Clock>) -> CarouselRotation {
        let now = clock.now();
        CarouselRotation {
            config,
            clock,
            items: Vec::new(),
            index: 0,
            state: CarouselState::Idle,
            deadline: None,
            last_advance: now,
            saved_elapsed: None,
            shown_since_reload: HashSet::new(),
            listeners: Vec::new(),
        }
    }

    /// Register a listener for every [`CarouselEvent`].
    pub fn on_state_changed(&mut self, listener: impl Fn(&CarouselEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Last state reported to listeners.
    pub fn state(&self) -> CarouselState {
        self.state
    }

    /// Items in display order.
    pub fn items(&self) -> &[CarouselItem] {
        &self.items
    }

    /// Position of the item currently shown.
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Item currently displayed.
    pub fn current(&self) -> Option<&CarouselItem> {
        self.items.get(self.index)
    }

    /// Instant the timer fires at, if armed.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    /// Return `true` if an automatic advance is scheduled.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Replace the items after a data reload and rotate from the first one.
    ///
    /// An empty list is how data errors surface: the carousel refreshes to nothing and stays
    /// disarmed.
    pub fn reload(&mut self, mut items: Vec<CarouselItem>) {
        if self.config.max_items > 0 {
            items.truncate(self.config.max_items);
        }
        self.deadline = None;
        self.saved_elapsed = None;
        self.shown_since_reload.clear();
        self.items = items;
        self.index = 0;

        self.refresh();
        self.show_current();
        self.start();
    }

    /// Arm the timer, resuming the time left on the current item if the timer was stopped.
    /// Does nothing if already armed.
    pub fn start(&mut self) {
        if self.is_armed() {
            return;
        }
        let now = self.clock.now();
        let saved = self.saved_elapsed.take().unwrap_or(Duration::ZERO);
        let remaining = self.config.interval.saturating_sub(saved);
        if self.arm(now, remaining) {
            self.last_advance = now - to_delta(saved);
        }
        self.transition(CarouselState::StartTimer);
    }

    /// Cancel the timer, remembering how long the current item has been shown. Safe to call
    /// when nothing is armed.
    pub fn stop(&mut self) {
        if self.deadline.take().is_none() {
            return;
        }
        let now = self.clock.now();
        self.saved_elapsed = Some(elapsed(self.last_advance, now));
        self.transition(CarouselState::StopTimer);
    }

    /// Stop rotating, e.g., when the app goes to the background.
    pub fn pause(&mut self) {
        self.stop();
    }

    /// Resume rotating with the remaining time of the current item.
    pub fn resume(&mut self) {
        self.start();
    }

    /// Discard saved progress and arm a full interval.
    pub fn restart(&mut self) {
        self.stop();
        self.saved_elapsed = None;
        self.transition(CarouselState::Restart);
        self.start();
    }

    /// Move to the next item, wrapping around to the first one. The outgoing item is reported
    /// hidden before the incoming one is reported shown.
    pub fn advance(&mut self) {
        if self.items.len() < 2 {
            return;
        }
        let was_armed = self.deadline.take().is_some();
        let now = self.clock.now();

        self.emit(CarouselEvent::ItemHidden {
            index: self.index,
            block_id: self.items[self.index].block_id.clone(),
        });
        self.index = (self.index + 1) % self.items.len();
        self.last_advance = now;
        self.saved_elapsed = None;
        self.transition(CarouselState::ShouldReload);
        self.show_current();

        if was_armed {
            self.arm(now, self.config.interval);
            self.transition(CarouselState::StartTimer);
        }
    }

    /// Advance if the armed timer is due. Returns `true` if it fired.
    pub fn tick(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if self.clock.now() >= deadline => {
                self.on_timer_fired();
                true
            }
            _ => false,
        }
    }

    /// The timer fired.
    pub fn on_timer_fired(&mut self) {
        log::debug!(target: "content_blocks", index = self.index; "carousel timer fired");
        self.advance();
    }

    /// Drop an item that can no longer be shown.
    pub fn remove_item(&mut self, block_id: &str) -> bool {
        let Some(position) = self.items.iter().position(|item| item.block_id == block_id) else {
            return false;
        };
        let removed = self.items.remove(position);

        let removed_current = position == self.index;
        if removed_current {
            self.emit(CarouselEvent::ItemHidden {
                index: position,
                block_id: removed.block_id,
            });
        }
        if position < self.index {
            self.index -= 1;
        }
        if self.index >= self.items.len() {
            self.index = 0;
        }

        let was_armed = self.deadline.take().is_some();
        if removed_current {
            // The incoming item gets a full interval.
            self.saved_elapsed = None;
        }
        if self.items.len() < 2 {
            self.saved_elapsed = None;
        }

        self.refresh();
        let now = self.clock.now();
        if removed_current {
            self.last_advance = now;
            self.show_current();
        }
        if was_armed {
            let remaining = if removed_current {
                self.config.interval
            } else {
                self.config.interval.saturating_sub(elapsed(self.last_advance, now))
            };
            self.arm(now, remaining);
        }
        true
    }

    /// The user closed the current item: drop it and rotate from a full interval.
    pub fn dismiss_current(&mut self) {
        if let Some(block_id) = self.current().map(|item| item.block_id.clone()) {
            self.remove_item(&block_id);
        }
        self.restart();
    }

    fn arm(&mut self, now: Timestamp, interval: Duration) -> bool {
        if self.items.len() < 2 || self.config.interval.is_zero() {
            return false;
        }
        self.deadline = Some(after(now, interval));
        true
    }

    fn refresh(&mut self) {
        self.transition(CarouselState::Refresh);
        self.emit(CarouselEvent::ItemsChanged {
            count: self.items.len(),
            items: self.items.clone(),
        });
    }

    fn show_current(&mut self) {
        let Some(item) = self.items.get(self.index) else {
            return;
        };
        let block_id = item.block_id.clone();
        let first_time = self.shown_since_reload.insert(block_id.clone());
        self.emit(CarouselEvent::ItemShown {
            index: self.index,
            block_id,
            first_time,
        });
    }

    fn transition(&mut self, state: CarouselState) {
        log::debug!(target: "content_blocks",
                    from:debug = self.state,
                    to:debug = state;
                    "carousel transition");
        self.state = state;
        self.emit(CarouselEvent::StateChanged(state));
    }

    fn emit(&self, event: CarouselEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use chrono::{TimeDelta, TimeZone, Utc};

    use super::{CarouselConfig, CarouselEvent, CarouselItem, CarouselRotation, CarouselState};
    use crate::clock::{Clock, ManualClock, Timestamp};

    fn item(id: &str) -> CarouselItem {
        CarouselItem {
            block_id: id.to_owned(),
            name: id.to_owned(),
            priority: 0,
            html: format!("<p>{id}</p>"),
        }
    }

    fn start() -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn carousel(interval: u64) -> (CarouselRotation, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let carousel = CarouselRotation::new(
            CarouselConfig::new().with_interval(Duration::from_secs(interval)),
            clock.clone(),
        );
        (carousel, clock)
    }

    fn record(carousel: &mut CarouselRotation) -> Arc<Mutex<Vec<CarouselEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        carousel.on_state_changed(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[test]
    fn stop_then_start_resumes_remaining_time() {
        let (mut carousel, clock) = carousel(10);
        carousel.reload(vec![item("a"), item("b")]);
        assert_eq!(
            carousel.next_deadline(),
            Some(start() + TimeDelta::seconds(10))
        );

        clock.advance(Duration::from_secs(4));
        carousel.stop();
        assert!(!carousel.is_armed());
        assert_eq!(carousel.state(), CarouselState::StopTimer);

        carousel.start();
        assert_eq!(
            carousel.next_deadline(),
            Some(start() + TimeDelta::seconds(10))
        );
    }

    #[test]
    fn restart_arms_full_interval() {
        let (mut carousel, clock) = carousel(10);
        carousel.reload(vec![item("a"), item("b")]);

        clock.advance(Duration::from_secs(4));
        carousel.stop();
        carousel.restart();

        assert_eq!(
            carousel.next_deadline(),
            Some(start() + TimeDelta::seconds(14))
        );
        assert_eq!(carousel.state(), CarouselState::StartTimer);
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut carousel, clock) = carousel(10);
        carousel.stop();
        assert_eq!(carousel.state(), CarouselState::Idle);

        carousel.reload(vec![item("a"), item("b")]);
        clock.advance(Duration::from_secs(4));
        carousel.stop();
        clock.advance(Duration::from_secs(3));
        carousel.stop();

        carousel.start();
        assert_eq!(
            carousel.next_deadline(),
            Some(clock.now() + TimeDelta::seconds(6))
        );
    }

    #[test]
    fn timer_advances_hidden_before_shown_and_wraps() {
        let (mut carousel, clock) = carousel(3);
        carousel.reload(vec![item("a"), item("b")]);
        let events = record(&mut carousel);

        clock.advance(Duration::from_secs(2));
        assert!(!carousel.tick());
        clock.advance(Duration::from_secs(1));
        assert!(carousel.tick());
        assert_eq!(carousel.current().unwrap().block_id, "b");

        clock.advance(Duration::from_secs(3));
        assert!(carousel.tick());
        assert_eq!(carousel.current_index(), 0);
        assert_eq!(
            carousel.next_deadline(),
            Some(clock.now() + TimeDelta::seconds(3))
        );

        let visibility: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                CarouselEvent::ItemHidden { block_id, .. } => Some(format!("-{block_id}")),
                CarouselEvent::ItemShown {
                    block_id,
                    first_time,
                    ..
                } => Some(format!("+{block_id}:{first_time}")),
                _ => None,
            })
            .collect();
        assert_eq!(visibility, ["-a", "+b:true", "-b", "+a:false"]);
    }

    #[test]
    fn wraparound_after_pause_uses_full_interval() {
        let (mut carousel, clock) = carousel(10);
        carousel.reload(vec![item("a"), item("b")]);

        clock.advance(Duration::from_secs(10));
        assert!(carousel.tick());
        clock.advance(Duration::from_secs(7));
        carousel.pause();
        carousel.resume();
        assert_eq!(
            carousel.next_deadline(),
            Some(clock.now() + TimeDelta::seconds(3))
        );

        clock.advance(Duration::from_secs(3));
        assert!(carousel.tick());
        assert_eq!(carousel.current_index(), 0);
        assert_eq!(
            carousel.next_deadline(),
            Some(clock.now() + TimeDelta::seconds(10))
        );
    }

    #[test]
    fn reload_reports_items_and_truncates() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut carousel = CarouselRotation::new(
            CarouselConfig::new().with_max_items(2),
            clock.clone(),
        );
        let events = record(&mut carousel);

        carousel.reload(vec![item("a"), item("b"), item("c")]);

        let events = events.lock().unwrap();
        assert_eq!(events[0], CarouselEvent::StateChanged(CarouselState::Refresh));
        assert!(matches!(
            &events[1],
            CarouselEvent::ItemsChanged { count: 2, items } if items.len() == 2
        ));
        assert!(matches!(
            &events[2],
            CarouselEvent::ItemShown { index: 0, first_time: true, .. }
        ));
        assert_eq!(
            events[3],
            CarouselEvent::StateChanged(CarouselState::StartTimer)
        );
    }

    #[test]
    fn single_item_never_arms() {
        let (mut carousel, _clock) = carousel(3);
        carousel.reload(vec![item("a")]);
        assert!(!carousel.is_armed());

        carousel.reload(Vec::new());
        assert!(!carousel.is_armed());
        assert!(carousel.current().is_none());
        assert!(!carousel.tick());
    }

    #[test]
    fn dismissing_current_item_restarts() {
        let (mut carousel, clock) = carousel(10);
        carousel.reload(vec![item("a"), item("b"), item("c")]);
        let events = record(&mut carousel);

        clock.advance(Duration::from_secs(4));
        carousel.dismiss_current();

        assert_eq!(carousel.items().len(), 2);
        assert_eq!(carousel.current().unwrap().block_id, "b");
        assert_eq!(
            carousel.next_deadline(),
            Some(clock.now() + TimeDelta::seconds(10))
        );
        assert!(events
            .lock()
            .unwrap()
            .contains(&CarouselEvent::StateChanged(CarouselState::Restart)));
    }

    #[test]
    fn removing_current_item_hides_it_and_rearms_full_interval() {
        let (mut carousel, clock) = carousel(10);
        carousel.reload(vec![item("a"), item("b"), item("c")]);
        let events = record(&mut carousel);

        clock.advance(Duration::from_secs(9));
        assert!(carousel.remove_item("a"));

        assert_eq!(carousel.current().unwrap().block_id, "b");
        assert_eq!(
            carousel.next_deadline(),
            Some(clock.now() + TimeDelta::seconds(10))
        );

        let events = events.lock().unwrap();
        let hidden = events
            .iter()
            .position(|event| {
                matches!(event, CarouselEvent::ItemHidden { block_id, .. } if block_id == "a")
            })
            .unwrap();
        let shown = events
            .iter()
            .position(|event| {
                matches!(event, CarouselEvent::ItemShown { block_id, .. } if block_id == "b")
            })
            .unwrap();
        assert!(hidden < shown);
    }

    #[test]
    fn removing_another_item_keeps_the_deadline() {
        let (mut carousel, clock) = carousel(10);
        carousel.reload(vec![item("a"), item("b"), item("c")]);

        clock.advance(Duration::from_secs(4));
        assert!(carousel.remove_item("c"));

        assert_eq!(carousel.current().unwrap().block_id, "a");
        assert_eq!(
            carousel.next_deadline(),
            Some(start() + TimeDelta::seconds(10))
        );
    }

    #[test]
    fn restart_reports_stop_before_start() {
        let (mut carousel, clock) = carousel(10);
        carousel.reload(vec![item("a"), item("b")]);
        let events = record(&mut carousel);

        clock.advance(Duration::from_secs(4));
        carousel.restart();

        let states: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                CarouselEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                CarouselState::StopTimer,
                CarouselState::Restart,
                CarouselState::StartTimer
            ]
        );
    }

    #[test]
    fn removing_down_to_one_item_disarms() {
        let (mut carousel, _clock) = carousel(10);
        carousel.reload(vec![item("a"), item("b")]);

        assert!(carousel.remove_item("b"));
        assert!(!carousel.remove_item("b"));
        assert!(!carousel.is_armed());
        assert_eq!(carousel.current().unwrap().block_id, "a");
    }
}
