//! Playback state machine
//!
//! Converts asynchronous player callbacks into a sequence of timed states.
//! Every mutation (state change, timer start/cancel, counters, impression
//! reset) runs inside one mutex per machine, and timer callbacks take the
//! same mutex before acting, so transitions form a total order.
//!
//! ```text
//!   player adapter ──transition(state, pos)──┐
//!                                            ▼
//!   heartbeat / timeout timers ──────▶ [ Mutex<Core> ] ──▶ listeners
//!                                      exit(old) → enter(new)
//! ```

mod behavior;
mod listener;

pub use listener::{PositionSource, StateMachineListener, StateSnapshot};

use crate::{
    config::CollectorConfig,
    timer::{Timer, TimerService},
    types::*,
    Result,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Timeout currently guarding the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Startup,
    Rebuffering,
}

/// Timers live at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveTimers {
    pub heartbeat: bool,
    pub timeout: Option<TimeoutKind>,
    pub quality_window: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerSlot {
    Heartbeat,
    Timeout,
    QualityWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatSchedule {
    Playing,
    Rebuffering,
}

/// Timer callback run under the machine lock
type Action = fn(&mut Context<'_>);

struct ArmedTimer {
    generation: u64,
    timer: Timer,
}

/// Identity and timing of one playback session
struct Impression {
    id: ImpressionId,
    session_start: DateTime<Utc>,
    first_ready: Option<DateTime<Utc>>,
}

impl Impression {
    fn new() -> Self {
        Self {
            id: ImpressionId::new(),
            session_start: Utc::now(),
            first_ready: None,
        }
    }
}

/// One state change, handed to exit and enter behaviors
struct Transition {
    from: PlayerState,
    to: PlayerState,
    at: Instant,
    elapsed: Duration,
}

struct Core {
    impression: Impression,
    current: PlayerState,
    entered_at: Instant,
    video_time_start_ms: u64,
    video_time_end_ms: u64,
    startup_time: Duration,
    player_startup_time: Option<Duration>,
    startup_finished: bool,
    seek_started_at: Option<Instant>,
    pending_error: Option<ErrorCode>,
    video_start_failed_reason: Option<VideoStartFailedReason>,
    quality_change_count: u32,
    custom_data: CustomData,
    pending_custom_data: Option<CustomData>,
    heartbeat: Option<ArmedTimer>,
    timeout: Option<(TimeoutKind, ArmedTimer)>,
    quality_window: Option<ArmedTimer>,
    next_generation: u64,
    listeners: Vec<Arc<dyn StateMachineListener>>,
    position_source: Option<Arc<dyn PositionSource>>,
}

impl Core {
    fn new(config: &CollectorConfig) -> Self {
        Self {
            impression: Impression::new(),
            current: PlayerState::Setup,
            entered_at: Instant::now(),
            video_time_start_ms: 0,
            video_time_end_ms: 0,
            startup_time: Duration::ZERO,
            player_startup_time: None,
            startup_finished: false,
            seek_started_at: None,
            pending_error: None,
            video_start_failed_reason: None,
            quality_change_count: 0,
            custom_data: config.custom_data.clone(),
            pending_custom_data: None,
            heartbeat: None,
            timeout: None,
            quality_window: None,
            next_generation: 0,
            listeners: Vec::new(),
            position_source: None,
        }
    }

    /// Start a fresh impression; listeners and the position source survive
    fn reset(&mut self, config: &CollectorConfig) {
        let listeners = std::mem::take(&mut self.listeners);
        let position_source = self.position_source.take();
        let next_generation = self.next_generation;

        // Dropping the old core's timers cancels them
        *self = Core::new(config);
        self.listeners = listeners;
        self.position_source = position_source;
        self.next_generation = next_generation;
    }

    fn slot_generation(&self, slot: TimerSlot) -> Option<u64> {
        match slot {
            TimerSlot::Heartbeat => self.heartbeat.as_ref().map(|t| t.generation),
            TimerSlot::Timeout => self.timeout.as_ref().map(|(_, t)| t.generation),
            TimerSlot::QualityWindow => self.quality_window.as_ref().map(|t| t.generation),
        }
    }
}

struct Shared {
    config: Arc<CollectorConfig>,
    timers: TimerService,
    core: Mutex<Core>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        // Critical sections never leave Core half-updated, a poisoned lock is still usable
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(self: &Arc<Self>, slot: TimerSlot, generation: u64, action: Action) {
        let mut core = self.lock();
        if core.slot_generation(slot) != Some(generation) {
            debug!(?slot, generation, "Ignoring stale timer");
            return;
        }
        let mut ctx = Context {
            core: &mut core,
            shared: self,
        };
        action(&mut ctx);
    }
}

/// Locked view of the machine used by behaviors and timer actions
struct Context<'a> {
    core: &'a mut Core,
    shared: &'a Arc<Shared>,
}

impl Context<'_> {
    fn config(&self) -> &CollectorConfig {
        &self.shared.config
    }

    fn transition(&mut self, to: PlayerState, position_ms: u64) {
        let from = self.core.current;
        // Repeated player callbacks are common; only errors are reported each time
        if from == to && to != PlayerState::Error {
            return;
        }

        let at = Instant::now();
        let elapsed = at.saturating_duration_since(self.core.entered_at);
        self.core.video_time_end_ms = position_ms;

        debug!(
            impression_id = %self.core.impression.id,
            from = %from,
            to = %to,
            elapsed_ms = as_millis(elapsed),
            position_ms,
            "State transition"
        );

        let transition = Transition { from, to, at, elapsed };
        (behavior::of(from).on_exit)(self, &transition);

        if from == PlayerState::Setup && self.core.player_startup_time.is_none() {
            self.core.player_startup_time = Some(elapsed);
        }
        if let Some(data) = self.core.pending_custom_data.take() {
            self.core.custom_data = data;
        }

        self.core.entered_at = at;
        self.core.video_time_start_ms = position_ms;
        self.core.current = to;
        if to.is_ready_like() && self.core.impression.first_ready.is_none() {
            self.core.impression.first_ready = Some(Utc::now());
        }

        (behavior::of(to).on_enter)(self, &transition);
    }

    fn current_position(&self) -> u64 {
        match &self.core.position_source {
            Some(source) => source.position_ms(),
            None => self.core.video_time_end_ms,
        }
    }

    fn snapshot(&self, state: PlayerState, next_state: Option<PlayerState>, duration_ms: u64) -> StateSnapshot {
        StateSnapshot {
            impression_id: self.core.impression.id,
            state,
            next_state,
            duration_ms,
            video_time_start_ms: self.core.video_time_start_ms,
            video_time_end_ms: self.core.video_time_end_ms,
            custom_data: self.core.custom_data.clone(),
            startup_finished: self.core.startup_finished,
            video_start_failed_reason: self.core.video_start_failed_reason,
            session_start: self.core.impression.session_start,
            first_ready: self.core.impression.first_ready,
        }
    }

    fn notify<F>(&self, state: PlayerState, next_state: Option<PlayerState>, duration_ms: u64, f: F)
    where
        F: Fn(&dyn StateMachineListener, &StateSnapshot),
    {
        let snapshot = self.snapshot(state, next_state, duration_ms);
        for listener in &self.core.listeners {
            f(listener.as_ref(), &snapshot);
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.core.next_generation += 1;
        self.core.next_generation
    }

    fn fire_callback(&self, slot: TimerSlot, generation: u64, action: Action) -> impl FnMut() + Send + 'static {
        let shared = Arc::downgrade(self.shared);
        move || {
            if let Some(shared) = shared.upgrade() {
                shared.fire(slot, generation, action);
            }
        }
    }

    fn arm_timeout(&mut self, kind: TimeoutKind, delay: Duration, action: Action) {
        let generation = self.next_generation();
        let callback = self.fire_callback(TimerSlot::Timeout, generation, action);
        let timer = self.shared.timers.schedule_once(delay, callback);
        self.core.timeout = Some((kind, ArmedTimer { generation, timer }));
    }

    fn cancel_timeout(&mut self) {
        if let Some((kind, armed)) = self.core.timeout.take() {
            armed.timer.cancel();
            debug!(?kind, generation = armed.generation, "Timeout cancelled");
        }
    }

    fn start_heartbeat(&mut self, schedule: HeartbeatSchedule) {
        let generation = self.next_generation();
        let callback = self.fire_callback(TimerSlot::Heartbeat, generation, behavior::heartbeat_tick);
        let timer = match schedule {
            HeartbeatSchedule::Playing => {
                let interval = self.config().heartbeat_interval();
                self.shared.timers.schedule_periodic(move |_| interval, callback)
            }
            HeartbeatSchedule::Rebuffering => {
                let config = self.shared.config.clone();
                self.shared.timers.schedule_periodic(
                    move |tick| config.rebuffering_heartbeat_interval(tick as usize),
                    callback,
                )
            }
        };
        self.core.heartbeat = Some(ArmedTimer { generation, timer });
    }

    fn cancel_heartbeat(&mut self) {
        if let Some(armed) = self.core.heartbeat.take() {
            armed.timer.cancel();
        }
    }

    fn ensure_quality_window(&mut self) {
        if self.core.quality_window.is_some() {
            return;
        }
        let generation = self.next_generation();
        let callback = self.fire_callback(
            TimerSlot::QualityWindow,
            generation,
            behavior::quality_window_elapsed,
        );
        let timer = self
            .shared
            .timers
            .schedule_once(self.config().quality_change_window(), callback);
        self.core.quality_window = Some(ArmedTimer { generation, timer });
    }

    fn reset(&mut self) {
        let previous = self.core.impression.id;
        self.core.reset(&self.shared.config);
        info!(
            previous_impression = %previous,
            impression_id = %self.core.impression.id,
            "Impression reset"
        );
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Analytics state machine for one player instance.
///
/// Cloning yields another handle to the same machine.
#[derive(Clone)]
pub struct StateMachine {
    shared: Arc<Shared>,
}

impl StateMachine {
    /// Create a machine whose timers run on `timers`
    pub fn new(config: CollectorConfig, timers: TimerService) -> Self {
        let core = Core::new(&config);
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                timers,
                core: Mutex::new(core),
            }),
        }
    }

    /// Create a machine on the runtime of the calling context
    pub fn with_current_runtime(config: CollectorConfig) -> Result<Self> {
        Ok(Self::new(config, TimerService::current()?))
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let mut core = self.shared.lock();
        let mut ctx = Context {
            core: &mut core,
            shared: &self.shared,
        };
        f(&mut ctx)
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.shared.config
    }

    /// Register a listener; listeners are notified in registration order
    pub fn add_listener(&self, listener: Arc<dyn StateMachineListener>) {
        self.shared.lock().listeners.push(listener);
    }

    pub fn clear_listeners(&self) {
        self.shared.lock().listeners.clear();
    }

    /// Source used to stamp heartbeats and timeout transitions with a position
    pub fn set_position_source(&self, source: Option<Arc<dyn PositionSource>>) {
        self.shared.lock().position_source = source;
    }

    /// Move to `to`: runs the exit behavior of the current state, then the
    /// enter behavior of `to`. Never rejects a transition; re-entering the
    /// current state is ignored except for `Error`.
    pub fn transition(&self, to: PlayerState, position_ms: u64) {
        self.with_context(|ctx| ctx.transition(to, position_ms));
    }

    pub fn pause(&self, position_ms: u64) {
        self.transition(PlayerState::Pause, position_ms);
    }

    pub fn seek(&self, position_ms: u64) {
        self.transition(PlayerState::Seeking, position_ms);
    }

    pub fn start_ad(&self, position_ms: u64) {
        self.transition(PlayerState::Ad, position_ms);
    }

    pub fn end_ad(&self, position_ms: u64) {
        self.transition(PlayerState::AdFinished, position_ms);
    }

    /// Report a player error; emits `on_error` with `error`
    pub fn error(&self, position_ms: u64, error: ErrorCode) {
        self.with_context(|ctx| {
            ctx.core.pending_error = Some(error);
            ctx.transition(PlayerState::Error, position_ms);
        });
    }

    /// End the session before the first frame was shown
    pub fn exit_before_video_start(&self, position_ms: u64, reason: VideoStartFailedReason) {
        self.with_context(|ctx| {
            ctx.core.video_start_failed_reason = Some(reason);
            ctx.transition(PlayerState::ExitBeforeVideoStart, position_ms);
        });
    }

    /// Close the current source's impression and start a new one
    pub fn source_change(&self, old_position_ms: u64, new_position_ms: u64, should_start_up: bool) {
        self.with_context(|ctx| {
            ctx.transition(PlayerState::SourceChanged, old_position_ms);
            ctx.reset();
            if should_start_up {
                ctx.transition(PlayerState::Startup, new_position_ms);
            }
        });
    }

    /// Change custom data. While playing or paused the current slice is
    /// closed first so it keeps the old data; otherwise the change applies
    /// when the current state is next exited.
    pub fn change_custom_data(&self, position_ms: u64, data: CustomData) {
        self.with_context(|ctx| {
            let original = ctx.core.current;
            ctx.core.pending_custom_data = Some(data);
            if matches!(original, PlayerState::Playing | PlayerState::Pause) {
                ctx.transition(PlayerState::CustomDataChange, position_ms);
                ctx.transition(original, position_ms);
            }
        });
    }

    /// Cancel all timers and start a new impression in `Setup`
    pub fn reset(&self) {
        self.with_context(|ctx| ctx.reset());
    }

    pub fn current_state(&self) -> PlayerState {
        self.shared.lock().current
    }

    /// Playback position from the position source, or the last reported one
    pub fn current_position(&self) -> u64 {
        self.with_context(|ctx| ctx.current_position())
    }

    pub fn impression_id(&self) -> ImpressionId {
        self.shared.lock().impression.id
    }

    pub fn session_start_timestamp(&self) -> DateTime<Utc> {
        self.shared.lock().impression.session_start
    }

    pub fn first_ready_timestamp(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().impression.first_ready
    }

    pub fn is_startup_finished(&self) -> bool {
        self.shared.lock().startup_finished
    }

    /// Total time spent in `Startup` for this impression
    pub fn startup_time(&self) -> Duration {
        self.shared.lock().startup_time
    }

    pub fn quality_change_count(&self) -> u32 {
        self.shared.lock().quality_change_count
    }

    /// False once the quality change threshold is exceeded in this window
    pub fn is_quality_change_enabled(&self) -> bool {
        self.shared.lock().quality_change_count <= self.shared.config.quality_change_threshold
    }

    pub fn custom_data(&self) -> CustomData {
        self.shared.lock().custom_data.clone()
    }

    pub fn video_start_failed_reason(&self) -> Option<VideoStartFailedReason> {
        self.shared.lock().video_start_failed_reason
    }

    pub fn active_timers(&self) -> ActiveTimers {
        let core = self.shared.lock();
        ActiveTimers {
            heartbeat: core.heartbeat.is_some(),
            timeout: core.timeout.as_ref().map(|(kind, _)| *kind),
            quality_window: core.quality_window.is_some(),
        }
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.lock();
        f.debug_struct("StateMachine")
            .field("impression_id", &core.impression.id)
            .field("current", &core.current)
            .field("startup_finished", &core.startup_finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordedEvent, RecordingListener};

    fn machine() -> (StateMachine, Arc<RecordingListener>) {
        let machine = StateMachine::with_current_runtime(CollectorConfig::default()).unwrap();
        let listener = Arc::new(RecordingListener::default());
        machine.add_listener(listener.clone());
        (machine, listener)
    }

    #[tokio::test]
    async fn test_starts_in_setup() {
        let (machine, _) = machine();
        assert_eq!(machine.current_state(), PlayerState::Setup);
        assert!(!machine.is_startup_finished());
        assert!(machine.first_ready_timestamp().is_none());
        assert_eq!(machine.active_timers(), ActiveTimers::default());
    }

    #[tokio::test]
    async fn test_every_transition_is_accepted() {
        let (machine, _) = machine();
        for from in PlayerState::ALL {
            for to in PlayerState::ALL {
                machine.reset();
                machine.transition(from, 0);
                machine.transition(to, 10);
                assert_eq!(machine.current_state(), to, "{from} -> {to}");
            }
        }
    }

    #[tokio::test]
    async fn test_repeated_state_is_ignored() {
        let (machine, listener) = machine();
        machine.transition(PlayerState::Startup, 0);
        machine.transition(PlayerState::Playing, 0);
        machine.transition(PlayerState::Playing, 100);
        assert!(listener.events().iter().all(|e| !matches!(e, RecordedEvent::PlayExit { .. })));
    }

    #[tokio::test]
    async fn test_repeated_errors_are_each_reported() {
        let (machine, listener) = machine();
        machine.error(0, ErrorCode::new(1, "first"));
        machine.error(0, ErrorCode::new(2, "second"));
        let codes: Vec<_> = listener
            .events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Error { code, .. } => Some(code.code),
                _ => None,
            })
            .collect();
        assert_eq!(codes, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_reset_generates_new_impression() {
        let (machine, _) = machine();
        let first = machine.impression_id();
        machine.transition(PlayerState::Startup, 0);
        machine.transition(PlayerState::Playing, 0);
        machine.reset();
        assert_ne!(machine.impression_id(), first);
        assert_eq!(machine.current_state(), PlayerState::Setup);
        assert!(machine.first_ready_timestamp().is_none());
        assert_eq!(machine.active_timers(), ActiveTimers::default());
    }

    #[tokio::test]
    async fn test_first_ready_set_once() {
        let (machine, _) = machine();
        machine.transition(PlayerState::Ready, 0);
        let first = machine.first_ready_timestamp();
        assert!(first.is_some());
        machine.transition(PlayerState::Pause, 0);
        assert_eq!(machine.first_ready_timestamp(), first);
    }

    #[tokio::test]
    async fn test_custom_data_change_while_playing_closes_slice() {
        let (machine, listener) = machine();
        machine.transition(PlayerState::Startup, 0);
        machine.transition(PlayerState::Playing, 0);

        let data = CustomData {
            custom_data_1: Some("new".into()),
            ..Default::default()
        };
        machine.change_custom_data(1_000, data.clone());

        assert_eq!(machine.current_state(), PlayerState::Playing);
        assert_eq!(machine.custom_data(), data);
        let exit = listener
            .events()
            .into_iter()
            .find_map(|e| match e {
                RecordedEvent::PlayExit { snapshot, .. } => Some(snapshot),
                _ => None,
            })
            .unwrap();
        assert_eq!(exit.custom_data, CustomData::default());
    }

    #[tokio::test]
    async fn test_custom_data_change_outside_playback_is_deferred() {
        let (machine, _) = machine();
        machine.transition(PlayerState::Startup, 0);
        let data = CustomData {
            experiment_name: Some("b".into()),
            ..Default::default()
        };
        machine.change_custom_data(0, data.clone());
        assert_eq!(machine.custom_data(), CustomData::default());

        machine.transition(PlayerState::Playing, 0);
        assert_eq!(machine.custom_data(), data);
    }

    #[tokio::test]
    async fn test_source_change_starts_new_impression() {
        let (machine, _) = machine();
        machine.transition(PlayerState::Startup, 0);
        machine.transition(PlayerState::Playing, 0);
        let before = machine.impression_id();

        machine.source_change(5_000, 0, true);

        assert_ne!(machine.impression_id(), before);
        assert_eq!(machine.current_state(), PlayerState::Startup);
        assert_eq!(machine.active_timers().timeout, Some(TimeoutKind::Startup));
        assert!(!machine.active_timers().heartbeat);
    }
}
