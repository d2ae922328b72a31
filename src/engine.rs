//! Service bootstrap: store, registry, dispatcher and sweeper wired together.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{DomainEvent, EventRouter};
use crate::notify::{
    AuditSink, Delivery, HttpTransport, MemoryAuditSink, NotificationDispatcher, StoreAuditSink,
    Transport, TracingAuditSink,
};
use crate::registry::{RecoveryReport, SubscriptionRegistry};
use crate::store::{self, StoreHandle};
use crate::sweeper::{SweepReport, Sweeper, SweeperHandle};
use crate::types::{Subscription, SubscriptionId, SubscriptionLinkList};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// A running subscription engine.
///
/// The registry is recovered from the store before `start` returns, so the
/// engine is ready to serve as soon as it exists.
pub struct Engine {
    store: StoreHandle,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    router: EventRouter,
    sweeper: Sweeper,
    sweeper_handle: Mutex<Option<SweeperHandle>>,
    recovery: RecoveryReport,
    recent_deliveries: Option<Arc<MemoryAuditSink>>,
}

impl Engine {
    /// Connect, recover and start sweeping. A store that cannot be reached
    /// fails startup.
    pub fn start(config: EngineConfig) -> Result<Self> {
        let store = store::connect_with(&config.store)?;
        let transport = Arc::new(HttpTransport::new(config.dispatcher.request_timeout())?);
        let recent = Arc::new(MemoryAuditSink::new(config.dispatcher.audit_capacity));
        let mut sinks: Vec<Arc<dyn AuditSink>> = vec![
            Arc::new(TracingAuditSink) as Arc<dyn AuditSink>,
            Arc::clone(&recent) as Arc<dyn AuditSink>,
        ];
        if config.dispatcher.persisted_audit_entries > 0 {
            sinks.push(Arc::new(StoreAuditSink::open(
                store.clone(),
                config.dispatcher.persisted_audit_entries,
            )?));
        }
        let audit: Arc<dyn AuditSink> = Arc::new(sinks);
        let mut engine = Self::from_parts(config, store, transport, audit, Arc::new(SystemClock))?;
        engine.recent_deliveries = Some(recent);
        Ok(engine)
    }

    /// Assemble an engine from caller-supplied collaborators.
    pub fn from_parts(
        config: EngineConfig,
        store: StoreHandle,
        transport: Arc<dyn Transport>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry = Arc::new(
            SubscriptionRegistry::new(store.clone(), &config.registry)
                .with_page_size(config.store.scan_page_size),
        );
        let recovery = registry.recover()?;

        let dispatcher = Arc::new(NotificationDispatcher::new(
            transport,
            audit,
            Arc::clone(&clock),
            &config.dispatcher,
        ));
        let router = EventRouter::new(Arc::clone(&registry), Arc::clone(&dispatcher));

        let sweeper = || {
            Sweeper::new(
                Arc::clone(&registry),
                Arc::clone(&dispatcher),
                Arc::clone(&clock),
            )
        };
        let sweeper_handle = if config.sweeper.enabled {
            Some(sweeper().spawn(config.sweeper.interval())?)
        } else {
            None
        };

        info!(
            namespace = %store.namespace(),
            restored = recovery.restored,
            sweeper = config.sweeper.enabled,
            "Subscription engine started"
        );

        Ok(Self {
            sweeper: sweeper(),
            store,
            registry,
            dispatcher,
            router,
            sweeper_handle: Mutex::new(sweeper_handle),
            recovery,
            recent_deliveries: None,
        })
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Result of the startup recovery.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Latest delivery audit entries, kept by engines built with `start`.
    pub fn recent_deliveries(&self) -> Option<&Arc<MemoryAuditSink>> {
        self.recent_deliveries.as_ref()
    }

    /// Register matchers before serving events.
    pub fn router_mut(&mut self) -> &mut EventRouter {
        &mut self.router
    }

    /// Create a subscription, sending a test notification if it asked for one.
    pub fn create(&self, sub: Subscription) -> Result<Subscription> {
        let created = self.registry.create(sub)?;
        if created.request_test_notification {
            if let Delivery::Failed(reason) = self.dispatcher.send_test(&created) {
                warn!(id = %created.id, reason = %reason, "Test notification not delivered");
            }
        }
        Ok(created)
    }

    pub fn get(&self, id: SubscriptionId) -> Result<Subscription> {
        self.registry.get(id)
    }

    pub fn update(&self, id: SubscriptionId, sub: Subscription) -> Result<Subscription> {
        self.registry.update(id, sub)
    }

    pub fn delete(&self, id: SubscriptionId) -> Result<Subscription> {
        self.registry.delete(id)
    }

    pub fn list(&self) -> SubscriptionLinkList {
        self.registry.link_list(None)
    }

    pub fn route_event(&self, event: &DomainEvent) -> Vec<(SubscriptionId, Delivery)> {
        self.router.route(event)
    }

    /// Sweep now, outside the background schedule.
    pub fn sweep_now(&self) -> SweepReport {
        self.sweeper.tick()
    }

    /// Stop the background sweeper. Idempotent.
    pub fn shutdown(&self) {
        if let Some(mut handle) = self.sweeper_handle.lock().take() {
            handle.stop();
            info!("Subscription engine stopped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SweeperConfig;
    use crate::error::EngineError;
    use crate::notify::RecordingTransport;
    use crate::types::{SubscriptionKind, TimeStamp};

    fn manual_engine(label: &str) -> (Engine, Arc<RecordingTransport>, ManualClock) {
        let config = EngineConfig {
            sweeper: SweeperConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let store = store::connect(&format!("memory://{}", label), "sbox").unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let clock = ManualClock::new(1_000);
        let engine = Engine::from_parts(
            config,
            store,
            transport.clone(),
            Arc::new(TracingAuditSink),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (engine, transport, clock)
    }

    #[test]
    fn test_create_sends_requested_test_notification() {
        let (engine, transport, _) = manual_engine("test-notif");
        engine
            .create(Subscription::new(SubscriptionKind::AssocSta, "http://quiet"))
            .unwrap();
        let created = engine
            .create(
                Subscription::new(SubscriptionKind::AssocSta, "http://cb").with_test_notification(),
            )
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body["notificationType"], "TestNotification");
        assert_eq!(
            sent[0].body["_links"]["subscription"]["href"].as_str(),
            created.self_link()
        );
    }

    #[test]
    fn test_sweep_now_uses_engine_clock() {
        let (engine, transport, clock) = manual_engine("sweep-now");
        let created = engine
            .create(
                Subscription::new(SubscriptionKind::AssocSta, "http://cb")
                    .with_expiry(TimeStamp::from_secs(1_001)),
            )
            .unwrap();

        assert_eq!(engine.sweep_now().expired, 0);
        clock.advance(1);
        assert_eq!(engine.sweep_now().expired, 1);
        assert!(matches!(engine.get(created.id), Err(EngineError::NotFound(_))));
        assert_eq!(transport.len(), 1);
    }

    #[test]
    fn test_start_fails_on_bad_address() {
        let config = EngineConfig {
            store: crate::config::StoreConfig {
                address: "redis://unreachable:6379".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            Engine::start(config),
            Err(EngineError::Connection(_))
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let config = EngineConfig::default();
        let engine = Engine::start(config).unwrap();
        assert!(engine.recent_deliveries().unwrap().is_empty());
        engine.shutdown();
        engine.shutdown();
    }

    #[test]
    fn test_start_can_persist_audit_entries() {
        let config = EngineConfig {
            store: crate::config::StoreConfig {
                address: "memory://engine-audit".into(),
                ..Default::default()
            },
            sweeper: SweeperConfig {
                enabled: false,
                ..Default::default()
            },
            dispatcher: crate::config::DispatcherConfig {
                persisted_audit_entries: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = Engine::start(config).unwrap();
        engine
            .create(
                Subscription::new(SubscriptionKind::RabEst, "http://127.0.0.1:9/cb")
                    .with_test_notification(),
            )
            .unwrap();

        let key = engine.store().key(crate::notify::HTTP_LOG_RESOURCE, 1);
        let fields = engine.store().hash_get_all(&key).unwrap().unwrap();
        assert_eq!(fields["resp_code"], "500");
        assert_eq!(fields["url"], "http://127.0.0.1:9/cb");
    }
}
