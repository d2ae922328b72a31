//! Subscription registry implementation.

use super::expiry::ExpiryIndex;
use crate::config::RegistryConfig;
use crate::error::{EngineError, Result};
use crate::store::{StoreHandle, DEFAULT_SCAN_PAGE_SIZE};
use crate::types::{
    id_from_self_link, LinkType, Subscription, SubscriptionId, SubscriptionKind,
    SubscriptionLinkEntry, SubscriptionLinkList, SubscriptionLinkListLinks, SubscriptionLinks,
    TimeStamp,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Outcome of rehydrating the registry from the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Subscriptions loaded into memory.
    pub restored: usize,
    /// Entries that could not be decoded or carried no usable self link.
    pub skipped: usize,
}

/// Everything guarded by the registry lock.
#[derive(Debug)]
struct RegistryState {
    /// Live subscriptions by id.
    subscriptions: HashMap<SubscriptionId, Subscription>,

    /// Next id to hand out. Never decreases.
    next_id: u64,

    expiry: ExpiryIndex,

    /// Deleted ids whose persisted entry could not be removed yet.
    unpurged: BTreeSet<SubscriptionId>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: 1,
            expiry: ExpiryIndex::new(),
            unpurged: BTreeSet::new(),
        }
    }
}

impl RegistryState {
    fn insert(&mut self, sub: Subscription) {
        if let Some(old) = self.subscriptions.insert(sub.id, sub.clone()) {
            if let Some(deadline) = old.expiry_deadline {
                self.expiry.unindex(old.id, deadline);
            }
        }
        if let Some(deadline) = sub.expiry_deadline {
            self.expiry.index(sub.id, deadline);
        }
    }

    fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let sub = self.subscriptions.remove(&id)?;
        if let Some(deadline) = sub.expiry_deadline {
            self.expiry.unindex(id, deadline);
        }
        Some(sub)
    }
}

/// Owns the live subscriptions of one service instance.
///
/// All map mutation is serialized by a single lock. Store I/O always happens
/// with the lock released, so a slow store never blocks readers.
pub struct SubscriptionRegistry {
    store: StoreHandle,

    /// Middle segment of the store key.
    resource_type: String,

    /// Self links are `base_path + "subscriptions/" + id`.
    base_path: String,

    page_size: usize,

    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new(store: StoreHandle, config: &RegistryConfig) -> Self {
        Self {
            store,
            resource_type: config.resource_type.clone(),
            base_path: config.base_path.clone(),
            page_size: DEFAULT_SCAN_PAGE_SIZE,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Keys fetched per round trip during recovery and bulk deletes.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Canonical store key of a subscription.
    pub fn key(&self, id: SubscriptionId) -> String {
        self.store.key(&self.resource_type, id)
    }

    pub fn self_link(&self, id: SubscriptionId) -> String {
        format!("{}subscriptions/{}", self.base_path, id)
    }

    /// Register a new subscription and return it with its id and self link.
    pub fn create(&self, mut sub: Subscription) -> Result<Subscription> {
        if !sub.has_delivery_target() {
            return Err(EngineError::InvalidSubscription(
                "callbackReference or websockNotifConfig is required".into(),
            ));
        }

        let id = {
            let mut state = self.state.lock();
            let id = SubscriptionId(state.next_id);
            state.next_id += 1;
            id
        };

        sub.id = id;
        sub.links = Some(SubscriptionLinks {
            self_link: LinkType {
                href: self.self_link(id),
            },
        });

        self.store.set(&self.key(id), &serde_json::to_value(&sub)?)?;

        self.state.lock().insert(sub.clone());

        info!(
            id = %id,
            kind = %sub.subscription_type,
            expiry = ?sub.expiry_deadline.map(|d| d.seconds),
            "Subscription created"
        );
        Ok(sub)
    }

    pub fn get(&self, id: SubscriptionId) -> Result<Subscription> {
        self.state
            .lock()
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.state.lock().subscriptions.contains_key(&id)
    }

    /// Replace an existing subscription. Its id and self link never change.
    pub fn update(&self, id: SubscriptionId, mut sub: Subscription) -> Result<Subscription> {
        let existing = self.get(id)?;

        if let Some(href) = sub.self_link() {
            if id_from_self_link(href) != Some(id) {
                return Err(EngineError::IdMismatch {
                    path: id,
                    body: href.to_string(),
                });
            }
        }
        if !sub.has_delivery_target() {
            return Err(EngineError::InvalidSubscription(
                "callbackReference or websockNotifConfig is required".into(),
            ));
        }

        sub.id = id;
        sub.links = existing.links;

        let key = self.key(id);
        self.store.set(&key, &serde_json::to_value(&sub)?)?;

        let replaced = {
            let mut state = self.state.lock();
            if state.subscriptions.contains_key(&id) {
                state.insert(sub.clone());
                true
            } else {
                false
            }
        };

        if !replaced {
            // Deleted while we were persisting; don't resurrect it.
            self.store.delete(&[key.as_str()])?;
            return Err(EngineError::NotFound(id));
        }

        debug!(
            id = %id,
            expiry = ?sub.expiry_deadline.map(|d| d.seconds),
            "Subscription updated"
        );
        Ok(sub)
    }

    /// Remove a subscription and its persisted entry.
    ///
    /// The subscription leaves memory before the store is touched, so a
    /// concurrent update cannot re-persist it. If the store delete fails the
    /// error is returned, the subscription stays gone, and the entry is
    /// retried by [`purge_deleted`](Self::purge_deleted).
    pub fn delete(&self, id: SubscriptionId) -> Result<Subscription> {
        let removed = self
            .state
            .lock()
            .remove(id)
            .ok_or(EngineError::NotFound(id))?;

        if let Err(e) = self.store.delete(&[self.key(id).as_str()]) {
            warn!(id = %id, error = %e, "Persisted entry of deleted subscription left behind");
            self.state.lock().unpurged.insert(id);
            return Err(e);
        }

        info!(id = %id, kind = %removed.subscription_type, "Subscription deleted");
        Ok(removed)
    }

    /// Retry removing persisted entries left behind by failed deletes.
    ///
    /// Returns how many were removed; failures stay queued.
    pub fn purge_deleted(&self) -> usize {
        let pending: Vec<SubscriptionId> = self.state.lock().unpurged.iter().copied().collect();

        let mut purged = 0;
        for id in pending {
            match self.store.delete(&[self.key(id).as_str()]) {
                Ok(_) => {
                    self.state.lock().unpurged.remove(&id);
                    debug!(id = %id, "Purged persisted entry of deleted subscription");
                    purged += 1;
                }
                Err(e) => {
                    debug!(id = %id, error = %e, "Persisted entry still not removable");
                }
            }
        }
        purged
    }

    /// Deleted ids whose persisted entry is still waiting to be purged.
    pub fn unpurged_count(&self) -> usize {
        self.state.lock().unpurged.len()
    }

    /// Delete every subscription, including stray persisted entries.
    ///
    /// Returns the number of live subscriptions removed.
    pub fn delete_all(&self) -> Result<usize> {
        let ids: Vec<SubscriptionId> = self.state.lock().subscriptions.keys().copied().collect();

        let mut removed = 0;
        for id in ids {
            match self.delete(id) {
                Ok(_) => removed += 1,
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let stray = self
            .store
            .flush_prefix(&self.store.prefix(&self.resource_type), self.page_size)?;
        if stray > 0 {
            warn!(count = stray, "Removed persisted subscriptions unknown to the registry");
        }

        Ok(removed)
    }

    /// Snapshot of every subscription accepted by `predicate`, ordered by id.
    pub fn list<F>(&self, predicate: F) -> Vec<Subscription>
    where
        F: Fn(&Subscription) -> bool,
    {
        let mut subs: Vec<Subscription> = self
            .state
            .lock()
            .subscriptions
            .values()
            .filter(|sub| predicate(sub))
            .cloned()
            .collect();
        subs.sort_by_key(|sub| sub.id);
        subs
    }

    pub fn list_by_kind(&self, kind: SubscriptionKind) -> Vec<Subscription> {
        self.list(|sub| sub.subscription_type == kind)
    }

    /// Collection body for the List operation, optionally narrowed to one kind.
    pub fn link_list(&self, kind: Option<SubscriptionKind>) -> SubscriptionLinkList {
        let subscriptions = self
            .list(|sub| kind.map_or(true, |k| sub.subscription_type == k))
            .into_iter()
            .map(|sub| SubscriptionLinkEntry {
                href: sub
                    .self_link()
                    .map(str::to_string)
                    .unwrap_or_else(|| self.self_link(sub.id)),
                subscription_type: sub.subscription_type,
            })
            .collect();

        SubscriptionLinkList {
            links: SubscriptionLinkListLinks {
                self_link: LinkType {
                    href: format!("{}subscriptions", self.base_path),
                },
                subscriptions,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id the next `create` will assign.
    pub fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.state.lock().next_id)
    }

    /// Subscriptions whose deadline second is at or before `now`.
    pub fn due(&self, now: TimeStamp) -> Vec<Subscription> {
        let state = self.state.lock();
        state
            .expiry
            .due(now)
            .into_iter()
            .filter_map(|id| state.subscriptions.get(&id).cloned())
            .collect()
    }

    /// Claim the subscriptions due at `now` for one sweep.
    ///
    /// Their buckets are emptied under the lock, so concurrent sweeps never
    /// claim the same id twice. An update that reschedules a claimed
    /// subscription indexes it again.
    pub fn take_due(&self, now: TimeStamp) -> Vec<Subscription> {
        let mut state = self.state.lock();
        let ids = state.expiry.take_due(now);
        ids.into_iter()
            .filter_map(|id| state.subscriptions.get(&id).cloned())
            .collect()
    }

    /// Drop swept expiry buckets at or before `now`.
    pub fn prune_expired(&self, now: TimeStamp) -> usize {
        self.state.lock().expiry.prune(now)
    }

    /// Number of ids currently held in the expiry index.
    pub fn indexed_count(&self) -> usize {
        self.state.lock().expiry.len()
    }

    /// Rebuild in-memory state from the store. Call once before serving.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut restored = Vec::new();

        let prefix = self.store.prefix(&self.resource_type);
        self.store.scan_prefix(&prefix, self.page_size, &mut |key, value| {
            let mut sub: Subscription = match serde_json::from_value(value.clone()) {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping malformed subscription");
                    report.skipped += 1;
                    return Ok(());
                }
            };

            match sub.self_link().and_then(id_from_self_link) {
                Some(id) => {
                    sub.id = id;
                    restored.push(sub);
                }
                None => {
                    warn!(key = %key, "Skipping subscription without a usable self link");
                    report.skipped += 1;
                }
            }
            Ok(())
        })?;

        let mut state = self.state.lock();
        for sub in restored {
            state.next_id = state.next_id.max(sub.id.0 + 1);
            state.insert(sub);
            report.restored += 1;
        }

        info!(
            restored = report.restored,
            skipped = report.skipped,
            next_id = state.next_id,
            "Subscriptions recovered"
        );
        Ok(report)
    }
}
