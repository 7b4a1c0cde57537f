use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tickbot_cache::{CacheError, CacheNamespace, EntityCache, RefreshReport, Tick};
use tickbot_events::{EventBus, EventEnvelope, EventSender, SystemEvent};
use tickbot_fsm::{BotBuilder, BotScript, BuildError, CooperativeScheduler, TickReport};
use tickbot_threads::ThreadRegistry;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::TickbotConfig;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Script(#[from] BuildError),
    #[error("bot '{0}' is registered more than once")]
    DuplicateBot(String),
    #[error("namespaces cannot be added to a cache that is already built")]
    NamespacesWithPrebuiltCache,
}

/// What happened during one host frame
#[derive(Debug)]
pub struct FrameReport {
    pub tick: Tick,
    pub cache: RefreshReport,
    /// One report per bot, in registration order
    pub bots: Vec<(String, TickReport)>,
    /// Workers that became zombies since the previous frame
    pub new_zombies: Vec<String>,
}

impl FrameReport {
    pub fn is_ok(&self) -> bool {
        self.cache.is_clean() && self.bots.iter().all(|(_, report)| report.is_ok())
    }
}

/// Per-frame coordination point between the host and the bots.
///
/// Each [`HostDriver::on_frame`] advances the tick, refreshes the entity cache
/// once and then ticks every bot against the fresh snapshots.
pub struct HostDriver {
    config: TickbotConfig,
    cache: Arc<EntityCache>,
    threads: Arc<ThreadRegistry>,
    bus: EventBus,
    events: EventSender,
    bots: Vec<CooperativeScheduler>,
    tick: Tick,
    reported_zombies: HashSet<String>,
}

impl HostDriver {
    pub fn builder() -> HostDriverBuilder {
        HostDriverBuilder::new()
    }

    /// Run one host frame
    pub fn on_frame(&mut self) -> FrameReport {
        self.tick += 1;
        let tick = self.tick;

        let cache = self.cache.refresh_if_due(tick);
        for failure in &cache.failed {
            self.events.publish(EventEnvelope::system_event(
                tick,
                SystemEvent::CacheRefreshFailed {
                    namespace: failure.namespace.clone(),
                    error: format!("{:#}", failure.error),
                    consecutive_failures: failure.consecutive_failures,
                },
            ));
        }

        let bots = self
            .bots
            .iter_mut()
            .map(|bot| {
                let report = bot.tick(tick);
                (bot.name().to_string(), report)
            })
            .collect();

        let new_zombies = self.report_zombies();

        FrameReport {
            tick,
            cache,
            bots,
            new_zombies,
        }
    }

    /// Report workers that have gone quiet for longer than the heartbeat timeout
    pub fn check_workers(&self) -> Vec<String> {
        let timeout = self.config.threads.heartbeat_timeout();
        self.threads
            .unresponsive(timeout)
            .into_iter()
            .map(|(name, silence)| {
                warn!(
                    target: "runner",
                    "Worker '{}' has been silent for {:?}", name, silence
                );
                self.events.publish(EventEnvelope::system_event(
                    self.tick,
                    SystemEvent::WorkerUnresponsive {
                        name: name.clone(),
                        silent_ms: silence.as_millis() as u64,
                    },
                ));
                name
            })
            .collect()
    }

    /// Stop every worker and return the ones that did not stop in time
    pub fn shutdown(&mut self) -> Vec<String> {
        let timeout = self.config.threads.stop_timeout();
        info!(
            target: "runner",
            "Shutting down {} worker(s), timeout {:?}",
            self.threads.len(),
            timeout
        );

        let results = self.threads.stop_all(timeout);
        for (name, result) in &results {
            if let Err(e) = result {
                warn!(target: "runner", "Worker '{}': {}", name, e);
            }
        }

        self.report_zombies();
        let mut zombies = self.threads.zombies();
        zombies.sort();

        self.events
            .publish(EventEnvelope::system_event(self.tick, SystemEvent::Shutdown));
        zombies
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe()
    }

    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    pub fn config(&self) -> &TickbotConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    pub fn bots(&self) -> &[CooperativeScheduler] {
        &self.bots
    }

    pub fn bot(&self, name: &str) -> Option<&CooperativeScheduler> {
        self.bots.iter().find(|bot| bot.name() == name)
    }

    pub fn bot_mut(&mut self, name: &str) -> Option<&mut CooperativeScheduler> {
        self.bots.iter_mut().find(|bot| bot.name() == name)
    }

    fn report_zombies(&mut self) -> Vec<String> {
        let mut fresh = Vec::new();
        for name in self.threads.zombies() {
            if self.reported_zombies.insert(name.clone()) {
                self.events.publish(EventEnvelope::system_event(
                    self.tick,
                    SystemEvent::WorkerZombied { name: name.clone() },
                ));
                fresh.push(name);
            }
        }
        fresh
    }
}

enum BotSource {
    Builder(BotBuilder),
    Script(Arc<BotScript>),
}

/// Builder for [`HostDriver`]
pub struct HostDriverBuilder {
    config: TickbotConfig,
    cache: Option<Arc<EntityCache>>,
    namespaces: Vec<CacheNamespace>,
    global: bool,
    threads: Option<Arc<ThreadRegistry>>,
    bots: Vec<BotSource>,
    event_capacity: usize,
}

impl HostDriverBuilder {
    fn new() -> Self {
        Self {
            config: TickbotConfig::default(),
            cache: None,
            namespaces: Vec::new(),
            global: false,
            threads: None,
            bots: Vec::new(),
            event_capacity: 256,
        }
    }

    pub fn config(mut self, config: TickbotConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already built cache instead of building one from namespaces
    pub fn cache(mut self, cache: Arc<EntityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Add a namespace; the configured backoff and interval overrides apply
    pub fn namespace(mut self, namespace: CacheNamespace) -> Self {
        self.namespaces.push(namespace);
        self
    }

    pub fn namespaces(mut self, namespaces: impl IntoIterator<Item = CacheNamespace>) -> Self {
        self.namespaces.extend(namespaces);
        self
    }

    /// Publish the built cache as the process-wide instance
    pub fn connect_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    pub fn threads(mut self, threads: Arc<ThreadRegistry>) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Register a bot; it takes the configured step failure policy
    pub fn bot(mut self, bot: BotBuilder) -> Self {
        self.bots.push(BotSource::Builder(bot));
        self
    }

    /// Register a finished script as is
    pub fn script(mut self, script: Arc<BotScript>) -> Self {
        self.bots.push(BotSource::Script(script));
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Result<HostDriver, DriverError> {
        let cache = match self.cache {
            Some(_) if !self.namespaces.is_empty() => {
                return Err(DriverError::NamespacesWithPrebuiltCache);
            }
            Some(cache) => cache,
            None => {
                let cache = EntityCache::builder()
                    .namespaces(
                        self.namespaces
                            .into_iter()
                            .map(|namespace| self.config.cache.apply(namespace)),
                    )
                    .build()?;
                if self.global {
                    connect_global(cache)?
                } else {
                    Arc::new(cache)
                }
            }
        };

        let threads = self.threads.unwrap_or_default();
        let bus = EventBus::new(self.event_capacity);
        let events = bus.create_sender();

        let mut names = HashSet::new();
        let mut bots = Vec::with_capacity(self.bots.len());
        for source in self.bots {
            let script = match source {
                BotSource::Builder(builder) => Arc::new(
                    builder
                        .on_step_failure(self.config.scheduler.on_step_failure.into())
                        .build()?,
                ),
                BotSource::Script(script) => script,
            };
            if !names.insert(script.name().to_string()) {
                return Err(DriverError::DuplicateBot(script.name().to_string()));
            }
            bots.push(
                CooperativeScheduler::new(script, cache.clone(), threads.clone())
                    .with_events(events.clone()),
            );
        }

        info!(
            target: "runner",
            "Host driver ready: {} namespace(s), {} bot(s)",
            cache.namespaces().count(),
            bots.len()
        );

        Ok(HostDriver {
            config: self.config,
            cache,
            threads,
            bus,
            events,
            bots,
            tick: 0,
            reported_zombies: HashSet::new(),
        })
    }
}

/// Hand `cache` to the global gate and return the shared instance
fn connect_global(cache: EntityCache) -> Result<Arc<EntityCache>, CacheError> {
    let slot = Mutex::new(Some(cache));
    EntityCache::connect_host(move || {
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    })?;
    EntityCache::get_instance()
}
