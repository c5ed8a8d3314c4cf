//! Change-notification dispatcher.
//!
//! State machine per service instance:
//!
//! ```text
//! Disconnected ──Connected──▶ Installing ──▶ Listening ──▶ Active
//!      ▲                                                    │
//!      └──────────────────────Disconnected──────────────────┘
//! ```
//!
//! Every `Connected` from the transport, the first one included, re-runs
//! trigger installation and `LISTEN` for all registered tables. A failed
//! initial connect is retried every `connect_retry` until it succeeds.
//!
//! When given the service's cache slot, the dispatcher fills it the first
//! time it reaches `Active`, so memoized calls bypass the cache until
//! invalidation is actually wired up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use pgcache_core::{
    filter_matches, ChangeEvent, PublishError, Tag, TransportError, DEFAULT_CONNECT_RETRY,
};
use pgcache_pg::{
    ChangeEventParser, InstallReport, NotificationTransport, TransportEvent, TriggerInstaller,
};
use pgcache_storage::TagIndexedCache;
use tokio::sync::watch;

use crate::memoize::CacheSlot;
use crate::publish::PublishSink;
use crate::registry::ChannelRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherState {
    Disconnected,
    Installing,
    Listening,
    Active,
}

/// What handling one change event did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Tags whose filter matched, in registration order.
    pub invalidated: Vec<Tag>,
    /// Tags whose filter rejected the event or failed.
    pub skipped: Vec<Tag>,
    /// Cache keys removed across all matched tags.
    pub keys_removed: u64,
    /// Successful republish calls.
    pub published: usize,
    /// Logged and swallowed failures (filter, invalidate, publish).
    pub failures: usize,
}

/// Routes change events from a transport to tag invalidations.
pub struct InvalidationDispatcher {
    class: String,
    registry: Arc<ChannelRegistry>,
    cache: Arc<TagIndexedCache>,
    transport: Arc<dyn NotificationTransport>,
    installer: TriggerInstaller,
    parser: ChangeEventParser,
    publisher: Option<Arc<dyn PublishSink>>,
    publish: bool,
    debug: bool,
    connect_retry: Duration,
    slot: Option<CacheSlot>,
    missing_sink_logged: AtomicBool,
    events_handled: AtomicU64,
    state: watch::Sender<DispatcherState>,
}

impl InvalidationDispatcher {
    pub fn new(
        class: impl Into<String>,
        registry: Arc<ChannelRegistry>,
        cache: Arc<TagIndexedCache>,
        transport: Arc<dyn NotificationTransport>,
    ) -> Self {
        let (state, _) = watch::channel(DispatcherState::Disconnected);
        Self {
            class: class.into(),
            registry,
            cache,
            transport,
            installer: TriggerInstaller::default(),
            parser: ChangeEventParser::new(),
            publisher: None,
            publish: true,
            debug: false,
            connect_retry: DEFAULT_CONNECT_RETRY,
            slot: None,
            missing_sink_logged: AtomicBool::new(false),
            events_handled: AtomicU64::new(0),
            state,
        }
    }

    pub fn with_installer(mut self, installer: TriggerInstaller) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_publisher(mut self, publisher: Option<Arc<dyn PublishSink>>) -> Self {
        self.publisher = publisher;
        self
    }

    /// `false` disables republishing even when a sink is set.
    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_connect_retry(mut self, delay: Duration) -> Self {
        self.connect_retry = delay;
        self
    }

    pub(crate) fn with_cache_slot(mut self, slot: CacheSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Notifications handled so far, parsed or not.
    pub fn events_handled(&self) -> u64 {
        self.events_handled.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Connect, retrying until the transport accepts, then process events
    /// until the transport ends.
    pub async fn run(&self) {
        let mut attempts = 0u32;
        while let Err(err) = self.transport.connect().await {
            if let TransportError::Closed { .. } = err {
                tracing::info!(service = %self.class, "notification transport closed before connecting");
                self.set_state(DispatcherState::Disconnected);
                return;
            }
            attempts += 1;
            tracing::warn!(
                service = %self.class,
                attempt = attempts,
                error = %err,
                retry_in = ?self.connect_retry,
                "notification transport connect failed"
            );
            tokio::time::sleep(self.connect_retry).await;
        }
        while let Some(event) = self.transport.next_event().await {
            self.handle_event(event).await;
        }
        self.set_state(DispatcherState::Disconnected);
        tracing::info!(service = %self.class, "notification transport closed");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.on_connected().await;
            }
            TransportEvent::Disconnected { reason } => {
                tracing::warn!(service = %self.class, reason = %reason, "notification transport disconnected");
                self.set_state(DispatcherState::Disconnected);
            }
            TransportEvent::Notification { channel, payload } => {
                if self.state() != DispatcherState::Active {
                    tracing::debug!(channel = %channel, state = ?self.state(), "notification before listening, dropped");
                    return;
                }
                self.handle_notification(&channel, &payload).await;
            }
        }
    }

    /// Installing → Listening → Active.
    pub async fn on_connected(&self) -> InstallReport {
        let tables = self.registry.tables();

        self.set_state(DispatcherState::Installing);
        let report = self.installer.install(&*self.transport, &tables).await;
        for failure in &report.failures {
            tracing::debug!(service = %self.class, error = %failure, "trigger install step skipped");
        }
        if self.debug {
            tracing::debug!(
                service = %self.class,
                installed = ?report.installed,
                function_installed = report.function_installed,
                "triggers installed"
            );
        }

        self.set_state(DispatcherState::Listening);
        let results = join_all(tables.iter().map(|table| self.transport.listen(table))).await;
        for (table, result) in tables.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(service = %self.class, channel = %table, error = %err, "listen failed");
            }
        }
        if self.debug {
            tracing::debug!(service = %self.class, channels = ?tables, "listening channels");
        }

        if let Some(slot) = &self.slot {
            if slot.set(Arc::clone(&self.cache)).is_ok() {
                tracing::info!(service = %self.class, "invalidation active, memoization enabled");
            }
        }
        self.set_state(DispatcherState::Active);
        report
    }

    /// Parse a raw payload and dispatch it. Malformed payloads are logged
    /// and dropped.
    pub async fn handle_notification(&self, channel: &str, payload: &str) -> Option<DispatchReport> {
        let report = match self.parser.parse(payload) {
            Ok(event) => {
                if self.debug {
                    tracing::debug!(channel, operation = %event.operation, "database event caught");
                }
                Some(self.dispatch(&event).await)
            }
            Err(err) => {
                tracing::warn!(channel, error = %err, "dropping malformed change payload");
                None
            }
        };
        self.events_handled.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Invalidate (and republish) every registered tag whose filter matches.
    pub async fn dispatch(&self, event: &ChangeEvent) -> DispatchReport {
        let channel = event.table.as_str();
        let mut report = DispatchReport::default();

        for entry in self.registry.entries_for(channel) {
            match filter_matches(entry.filter.as_ref(), event) {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped.push(entry.tag.clone());
                    continue;
                }
                Err(err) => {
                    tracing::warn!(channel, tag = %entry.tag, error = %err, "filter failed, treating as no match");
                    report.failures += 1;
                    report.skipped.push(entry.tag.clone());
                    continue;
                }
            }

            match self.cache.invalidate(&entry.tag).await {
                Ok(removed) => {
                    report.keys_removed += removed;
                    if self.debug {
                        tracing::debug!(tag = %entry.tag, removed, "tag invalidated");
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(tag = %entry.tag, error = %err, "error invalidating tag");
                }
            }
            report.invalidated.push(entry.tag.clone());

            self.republish(channel, event, &entry.tag, &mut report).await;
        }

        report
    }

    async fn republish(&self, channel: &str, event: &ChangeEvent, tag: &Tag, report: &mut DispatchReport) {
        if !self.publish {
            return;
        }
        let Some(sink) = &self.publisher else {
            if !self.missing_sink_logged.swap(true, Ordering::Relaxed) {
                tracing::info!(service = %self.class, "no publish sink configured, republishing disabled");
            }
            return;
        };

        match sink.publish(channel, event, tag).await {
            Ok(()) => {
                report.published += 1;
                if self.debug {
                    tracing::debug!(channel, tag = %tag, "tag published to clients");
                }
            }
            Err(PublishError::NoSubscribers { .. }) => {
                tracing::debug!(channel, tag = %tag, "no subscribers for republished event");
            }
            Err(err) => {
                report.failures += 1;
                tracing::warn!(channel, tag = %tag, error = %err, "error publishing tag");
            }
        }
    }

    fn set_state(&self, next: DispatcherState) {
        self.state.send_replace(next);
    }
}

impl std::fmt::Debug for InvalidationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationDispatcher")
            .field("class", &self.class)
            .field("state", &self.state())
            .field("channels", &self.registry.tables())
            .field("publish", &self.publish)
            .finish()
    }
}
