//! Core event types for tickbot
//!
//! This crate sits at the bottom of the workspace so the cache, the thread
//! registry and the scheduler can all report what happened without depending
//! on each other.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

pub mod consumers;

pub use consumers::{HistoryConsumer, HistoryEntry, LoggingConsumer};

/// One discrete host update cycle
pub type Tick = u64;

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by a bot's scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    /// Entry action of a state ran
    StateEntered { state: String },
    /// Exit action of a state ran
    StateExited { state: String },
    /// A transition predicate matched after the step completed
    Transitioned { from: String, to: String },
    /// Cursor was forced to a state, bypassing transition predicates
    Jumped { from: String, to: String },
    /// A step (or entry action) failed and was aborted
    StepFailed { state: String, error: String },
    /// A wait point exceeded its bound
    SuspensionTimedOut { state: String, waited_ticks: u64 },
    /// A recovery policy preempted normal execution
    RecoveryActivated { policy: String, interrupted: String },
    /// A recovery program ran to completion
    RecoveryCompleted { policy: String, resumed: String },
    /// A recovery program failed; the bot is paused
    RecoveryFailed { policy: String, error: String },
    /// A recovery trigger could not be evaluated this tick
    RecoveryEvaluationFailed { policy: String, error: String },
    Paused,
    Resumed,
}

/// Events emitted by the runtime around the bots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// A namespace provider failed; readers keep the previous snapshot
    CacheRefreshFailed {
        namespace: String,
        error: String,
        consecutive_failures: u32,
    },
    /// A worker did not honor its stop signal in time
    WorkerZombied { name: String },
    /// A worker has not sent a keepalive recently
    WorkerUnresponsive { name: String, silent_ms: u64 },
    Shutdown,
}

/// Unified event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Bot(BotEvent),
    System(SystemEvent),
}

/// Coarse classification used by consumers for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl EventType {
    pub fn severity(&self) -> EventSeverity {
        match self {
            EventType::Bot(event) => match event {
                BotEvent::StateEntered { .. }
                | BotEvent::StateExited { .. }
                | BotEvent::Transitioned { .. } => EventSeverity::Debug,
                BotEvent::Jumped { .. }
                | BotEvent::RecoveryActivated { .. }
                | BotEvent::RecoveryCompleted { .. }
                | BotEvent::Paused
                | BotEvent::Resumed => EventSeverity::Info,
                BotEvent::SuspensionTimedOut { .. } | BotEvent::RecoveryEvaluationFailed { .. } => {
                    EventSeverity::Warning
                }
                BotEvent::StepFailed { .. } | BotEvent::RecoveryFailed { .. } => {
                    EventSeverity::Error
                }
            },
            EventType::System(event) => match event {
                SystemEvent::CacheRefreshFailed { .. } | SystemEvent::WorkerUnresponsive { .. } => {
                    EventSeverity::Warning
                }
                SystemEvent::WorkerZombied { .. } => EventSeverity::Error,
                SystemEvent::Shutdown => EventSeverity::Info,
            },
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Context information attached to all events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// Name of the bot that produced the event, if any
    pub bot: Option<String>,
    /// Host tick the event happened on
    pub tick: Tick,
}

/// Complete event envelope
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: EventType,
    pub context: EventContext,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event: EventType, context: EventContext) -> Self {
        Self {
            event,
            context,
            timestamp: Utc::now(),
        }
    }

    pub fn bot_event(bot: impl Into<String>, tick: Tick, event: BotEvent) -> Self {
        let context = EventContext {
            bot: Some(bot.into()),
            tick,
        };
        Self::new(EventType::Bot(event), context)
    }

    pub fn system_event(tick: Tick, event: SystemEvent) -> Self {
        let context = EventContext { bot: None, tick };
        Self::new(EventType::System(event), context)
    }

    pub fn severity(&self) -> EventSeverity {
        self.event.severity()
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Handle used by producers to publish events
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventSender {
    /// A sender whose events go nowhere, for components built without a bus
    pub fn detached() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    pub fn publish(&self, envelope: EventEnvelope) {
        // No subscribers is not an error: tick reports and logs still carry failures
        let _ = self.sender.send(envelope);
    }
}

/// Central event bus
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn create_sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Trait for components that handle events
pub trait EventConsumer: Send + 'static {
    fn handle_event(&mut self, envelope: &EventEnvelope);
}

/// Deliver every event currently queued on `receiver` to `consumers`.
///
/// Never blocks, so it can run from the host tick. Returns how many events were
/// delivered; lagged events are skipped with a warning.
pub fn dispatch_pending(
    receiver: &mut broadcast::Receiver<EventEnvelope>,
    consumers: &mut [Box<dyn EventConsumer>],
) -> usize {
    let mut delivered = 0;
    loop {
        match receiver.try_recv() {
            Ok(envelope) => {
                for consumer in consumers.iter_mut() {
                    consumer.handle_event(&envelope);
                }
                delivered += 1;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(target: "events", "Event consumers lagged, skipped {} event(s)", skipped);
            }
            Err(broadcast::error::TryRecvError::Empty)
            | Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }
    delivered
}
