use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{EventConsumer, EventEnvelope, EventSeverity, EventType, Tick};

/// Consumer that forwards every event to tracing at its severity
pub struct LoggingConsumer;

impl EventConsumer for LoggingConsumer {
    fn handle_event(&mut self, envelope: &EventEnvelope) {
        let bot = envelope.context.bot.as_deref().unwrap_or("-");
        let tick = envelope.context.tick;
        match envelope.severity() {
            EventSeverity::Debug => {
                debug!(target: "events", bot, tick, "{:?}", envelope.event)
            }
            EventSeverity::Info => info!(target: "events", bot, tick, "{:?}", envelope.event),
            EventSeverity::Warning => warn!(target: "events", bot, tick, "{:?}", envelope.event),
            EventSeverity::Error => error!(target: "events", bot, tick, "{:?}", envelope.event),
        }
    }
}

/// A single retained history entry
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub tick: Tick,
    pub bot: Option<String>,
    pub severity: EventSeverity,
    pub event: EventType,
}

impl HistoryEntry {
    /// `[HH:MM:SS] bot: event` line for status displays
    pub fn formatted(&self) -> String {
        format!(
            "[{}] {}: {:?}",
            self.timestamp.format("%H:%M:%S"),
            self.bot.as_deref().unwrap_or("system"),
            self.event
        )
    }
}

/// Bounded, newest-first event history for overlays and post-mortems
pub struct HistoryConsumer {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    min_severity: EventSeverity,
}

impl HistoryConsumer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            min_severity: EventSeverity::Debug,
        }
    }

    /// Only retain events at or above `severity`
    pub fn with_min_severity(mut self, severity: EventSeverity) -> Self {
        self.min_severity = severity;
        self
    }

    /// Entries, newest first
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_severity(&self, severity: EventSeverity) -> Vec<&HistoryEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.severity == severity)
            .collect()
    }

    pub fn errors(&self) -> Vec<&HistoryEntry> {
        self.by_severity(EventSeverity::Error)
    }

    pub fn warnings(&self) -> Vec<&HistoryEntry> {
        self.by_severity(EventSeverity::Warning)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl EventConsumer for HistoryConsumer {
    fn handle_event(&mut self, envelope: &EventEnvelope) {
        let severity = envelope.severity();
        if severity < self.min_severity {
            return;
        }

        self.entries.push_front(HistoryEntry {
            timestamp: envelope.timestamp,
            tick: envelope.context.tick,
            bot: envelope.context.bot.clone(),
            severity,
            event: envelope.event.clone(),
        });
        self.entries.truncate(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BotEvent, SystemEvent};

    #[test]
    fn test_history_is_newest_first_and_bounded() {
        let mut history = HistoryConsumer::new(2);
        for tick in 1..=3 {
            history.handle_event(&EventEnvelope::bot_event("bot", tick, BotEvent::Paused));
        }

        let ticks: Vec<Tick> = history.entries().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![3, 2]);
    }

    #[test]
    fn test_history_filters_by_min_severity() {
        let mut history = HistoryConsumer::new(10).with_min_severity(EventSeverity::Warning);
        history.handle_event(&EventEnvelope::bot_event(
            "bot",
            1,
            BotEvent::StateEntered {
                state: "Idle".into(),
            },
        ));
        history.handle_event(&EventEnvelope::system_event(
            2,
            SystemEvent::WorkerZombied {
                name: "pathing".into(),
            },
        ));

        assert_eq!(history.len(), 1);
        assert_eq!(history.errors().len(), 1);
        assert!(history.warnings().is_empty());
        assert!(history.entries().next().map(|e| e.formatted().contains("system")).unwrap_or(false));
    }
}
