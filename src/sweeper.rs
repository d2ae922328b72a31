//! Periodic reaper of expired subscriptions.
//!
//! A sweep claims the due subscriptions under the registry lock, releases
//! it, sends each expiry notification, and only then deletes. Claiming
//! empties the buckets, so each subscription is notified at most once even
//! with several sweeps running. Notification I/O never happens with the
//! registry locked.

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::notify::{Delivery, NotificationDispatcher};
use crate::registry::SubscriptionRegistry;
use crate::types::TimeStamp;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Subscriptions retired.
    pub expired: usize,
    /// Expiry notifications acknowledged with a 2xx.
    pub delivered: usize,
    /// Due subscriptions already gone or rescheduled by the time we got there.
    pub skipped: usize,
    /// Store failures while deleting. The subscription is gone either way;
    /// its persisted entry is purged by a later sweep.
    pub errors: usize,
    /// Persisted entries of earlier failed deletes removed by this sweep.
    pub purged: usize,
}

pub struct Sweeper {
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    clock: Arc<dyn Clock>,
}

impl Sweeper {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            clock,
        }
    }

    /// Sweep using the sweeper's clock.
    pub fn tick(&self) -> SweepReport {
        self.sweep(self.clock.now())
    }

    /// Retire every subscription whose deadline second is at or before `now`.
    pub fn sweep(&self, now: TimeStamp) -> SweepReport {
        let mut report = SweepReport {
            purged: self.registry.purge_deleted(),
            ..Default::default()
        };

        for sub in self.registry.take_due(now) {
            if !self.registry.contains(sub.id) {
                report.skipped += 1;
                continue;
            }

            let delivery = self.dispatcher.send_expiry(&sub);
            if let Delivery::Delivered { .. } = delivery {
                report.delivered += 1;
            }

            // Re-check: an update may have moved the deadline meanwhile.
            let still_due = match self.registry.get(sub.id) {
                Ok(current) => current
                    .expiry_deadline
                    .map_or(false, |d| d.seconds <= now.seconds),
                Err(_) => false,
            };
            if !still_due {
                report.skipped += 1;
                continue;
            }

            match self.registry.delete(sub.id) {
                Ok(_) => {
                    info!(id = %sub.id, delivery = ?delivery, "Subscription expired");
                    report.expired += 1;
                }
                Err(EngineError::NotFound(_)) => report.skipped += 1,
                Err(e) => {
                    error!(
                        id = %sub.id,
                        error = %e,
                        "Failed to remove expired subscription from store"
                    );
                    report.errors += 1;
                }
            }
        }

        let pruned = self.registry.prune_expired(now);
        if report != SweepReport::default() || pruned > 0 {
            debug!(
                now = now.seconds,
                expired = report.expired,
                skipped = report.skipped,
                purged = report.purged,
                pruned,
                "Sweep complete"
            );
        }
        report
    }

    /// Run `tick` every `interval` on a dedicated thread.
    pub fn spawn(self, interval: Duration) -> Result<SweeperHandle> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);

        let worker = thread::Builder::new()
            .name("subscription-sweeper".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                debug!(interval_ms = interval.as_millis() as u64, "Sweeper started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            self.tick();
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!("Sweeper stopped");
            })?;

        Ok(SweeperHandle {
            shutdown: Some(shutdown),
            worker: Some(worker),
        })
    }
}

/// Owner of a running sweeper thread. Dropping it stops the thread.
pub struct SweeperHandle {
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signal the thread and wait for the current sweep to finish.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Sweeper thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{DispatcherConfig, RegistryConfig};
    use crate::notify::{MemoryAuditSink, RecordingTransport, Transport, TransportResponse};
    use crate::store::faulty::FaultyStore;
    use crate::store::{connect, StoreHandle};
    use crate::types::{Subscription, SubscriptionId, SubscriptionKind};
    use std::time::Instant;

    const T: i64 = 1_700_000_000;

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<RecordingTransport>,
        clock: ManualClock,
        sweeper: Sweeper,
    }

    fn fixture(label: &str) -> Fixture {
        let store = connect(&format!("memory://{}", label), "sbox").unwrap();
        let registry = Arc::new(SubscriptionRegistry::new(
            store,
            &RegistryConfig {
                resource_type: "subscriptions".into(),
                base_path: "http://host/wai/v2/".into(),
            },
        ));
        let transport = Arc::new(RecordingTransport::new());
        let clock = ManualClock::new(T);
        let dispatcher = Arc::new(NotificationDispatcher::new(
            transport.clone(),
            Arc::new(MemoryAuditSink::new(64)),
            Arc::new(clock.clone()),
            &DispatcherConfig::default(),
        ));
        let sweeper = Sweeper::new(registry.clone(), dispatcher, Arc::new(clock.clone()));
        Fixture {
            registry,
            transport,
            clock,
            sweeper,
        }
    }

    #[test]
    fn test_concrete_expiry_scenario() {
        let f = fixture("scenario");
        let created = f
            .registry
            .create(
                Subscription::new(SubscriptionKind::AssocSta, "http://cb")
                    .with_expiry(TimeStamp::from_secs(T + 1)),
            )
            .unwrap();
        assert_eq!(created.id, SubscriptionId(1));
        assert!(created.self_link().unwrap().ends_with("/subscriptions/1"));

        let report = f.sweeper.sweep(TimeStamp::from_secs(T + 2));
        assert_eq!(report.expired, 1);

        let posts = f.transport.requests_to("http://cb");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].body["expiryDeadline"]["seconds"], T + 1);
        assert!(f.registry.get(SubscriptionId(1)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_not_expired_before_deadline() {
        let f = fixture("deadline");
        let created = f
            .registry
            .create(
                Subscription::new(SubscriptionKind::AssocSta, "http://cb")
                    .with_expiry(TimeStamp::from_secs(T + 2)),
            )
            .unwrap();

        f.clock.advance(1);
        assert_eq!(f.sweeper.tick(), SweepReport::default());
        assert!(f.registry.get(created.id).is_ok());

        f.clock.advance(1);
        assert_eq!(f.sweeper.tick().expired, 1);
        assert!(f.registry.get(created.id).is_err());

        // Re-sweeping the same second is a no-op
        assert_eq!(f.sweeper.tick(), SweepReport::default());
        assert_eq!(f.transport.len(), 1);
    }

    #[test]
    fn test_shared_bucket_processed_independently() {
        let f = fixture("bucket");
        for url in ["http://a", "http://b"] {
            f.registry
                .create(
                    Subscription::new(SubscriptionKind::StaDataRate, url)
                        .with_expiry(TimeStamp::from_secs(T)),
                )
                .unwrap();
        }
        f.registry
            .create(Subscription::new(SubscriptionKind::StaDataRate, "http://never"))
            .unwrap();

        let report = f.sweeper.sweep(TimeStamp::from_secs(T));
        assert_eq!(report.expired, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(f.transport.requests_to("http://a").len(), 1);
        assert_eq!(f.transport.requests_to("http://b").len(), 1);
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn test_failed_delivery_still_expires() {
        let f = fixture("failed");
        f.transport.set_status(0);
        f.registry
            .create(
                Subscription::new(SubscriptionKind::RabEst, "http://down")
                    .with_expiry(TimeStamp::from_secs(T)),
            )
            .unwrap();

        let report = f.sweeper.sweep(TimeStamp::from_secs(T + 5));
        assert_eq!(report.expired, 1);
        assert_eq!(report.delivered, 0);
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_deleted_before_sweep_is_not_notified() {
        let f = fixture("deleted");
        let created = f
            .registry
            .create(
                Subscription::new(SubscriptionKind::AssocSta, "http://cb")
                    .with_expiry(TimeStamp::from_secs(T)),
            )
            .unwrap();
        f.registry.delete(created.id).unwrap();

        assert_eq!(f.sweeper.sweep(TimeStamp::from_secs(T + 1)), SweepReport::default());
        assert!(f.transport.is_empty());
    }

    #[test]
    fn test_background_thread_sweeps_and_stops() {
        let f = fixture("thread");
        f.registry
            .create(
                Subscription::new(SubscriptionKind::V2xMsg, "http://cb")
                    .with_expiry(TimeStamp::from_secs(T + 1)),
            )
            .unwrap();

        let Fixture {
            registry,
            transport,
            clock,
            sweeper,
        } = f;
        let mut handle = sweeper.spawn(Duration::from_millis(10)).unwrap();
        assert!(handle.is_running());

        clock.advance(1);
        let started = Instant::now();
        while !registry.is_empty() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(registry.is_empty());
        assert_eq!(transport.len(), 1);

        handle.stop();
        assert!(!handle.is_running());
    }

    fn dispatcher_for(
        transport: Arc<dyn Transport>,
        clock: &ManualClock,
    ) -> Arc<NotificationDispatcher> {
        Arc::new(NotificationDispatcher::new(
            transport,
            Arc::new(MemoryAuditSink::new(64)),
            Arc::new(clock.clone()),
            &DispatcherConfig::default(),
        ))
    }

    #[test]
    fn test_failed_store_delete_notifies_once() {
        let faulty = Arc::new(FaultyStore::new("sweep-faulty"));
        let registry = Arc::new(SubscriptionRegistry::new(
            StoreHandle::new(faulty.clone(), "sbox"),
            &RegistryConfig::default(),
        ));
        let transport = Arc::new(RecordingTransport::new());
        let clock = ManualClock::new(T);
        let sweeper = Sweeper::new(
            registry.clone(),
            dispatcher_for(transport.clone(), &clock),
            Arc::new(clock.clone()),
        );

        let created = registry
            .create(
                Subscription::new(SubscriptionKind::AssocSta, "http://cb")
                    .with_expiry(TimeStamp::from_secs(100)),
            )
            .unwrap();

        faulty.fail_deletes(true);
        let first = sweeper.sweep(TimeStamp::from_secs(101));
        assert_eq!(first.errors, 1);
        assert_eq!(first.expired, 0);
        for _ in 0..2 {
            assert_eq!(sweeper.sweep(TimeStamp::from_secs(101)).delivered, 0);
        }
        assert_eq!(transport.len(), 1);
        assert!(!registry.contains(created.id));

        // Once the store recovers, the leftover entry goes without a second notification
        faulty.fail_deletes(false);
        assert_eq!(sweeper.sweep(TimeStamp::from_secs(102)).purged, 1);
        assert_eq!(registry.store().get(&registry.key(created.id)).unwrap(), None);
        assert_eq!(transport.len(), 1);
    }

    struct SlowTransport {
        inner: RecordingTransport,
        delay: Duration,
    }

    impl Transport for SlowTransport {
        fn post_json(&self, url: &str, body: &str) -> Result<TransportResponse> {
            thread::sleep(self.delay);
            self.inner.post_json(url, body)
        }
    }

    #[test]
    fn test_concurrent_sweeps_notify_once() {
        let store = connect("memory://sweep-concurrent", "sbox").unwrap();
        let registry = Arc::new(SubscriptionRegistry::new(store, &RegistryConfig::default()));
        let transport = Arc::new(SlowTransport {
            inner: RecordingTransport::new(),
            delay: Duration::from_millis(100),
        });
        let clock = ManualClock::new(T);

        registry
            .create(
                Subscription::new(SubscriptionKind::AssocSta, "http://cb")
                    .with_expiry(TimeStamp::from_secs(100)),
            )
            .unwrap();

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let sweeper = Sweeper::new(
                    registry.clone(),
                    dispatcher_for(transport.clone(), &clock),
                    Arc::new(clock.clone()),
                );
                thread::spawn(move || sweeper.sweep(TimeStamp::from_secs(101)))
            })
            .collect();
        let reports: Vec<SweepReport> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(reports.iter().map(|r| r.expired).sum::<usize>(), 1);
        assert_eq!(reports.iter().map(|r| r.delivered).sum::<usize>(), 1);
        assert_eq!(transport.inner.len(), 1);
        assert!(registry.is_empty());
    }
}
