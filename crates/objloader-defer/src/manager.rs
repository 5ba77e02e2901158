//! The dependency gate between resolution and emission.
//!
//! [`DefermentManager`] holds every resolved Item whose closure has not been
//! fully released yet. It keeps a pending-children set per held Item and a
//! reverse index (`waiters`) from a child to the held Items blocked on it.
//!
//! # Invariants
//!
//! - An Item is released only after every id in its closure was released.
//! - Each id is released or failed at most once.
//! - Release and failure propagation use explicit work-lists, so graph depth
//!   never grows the call stack.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use objloader_types::{BaseId, Item};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::DeferError;

/// Deferment tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefermentConfig {
    /// How long held Items may go without any progress before they are
    /// failed as a cycle or missing dependency.
    pub timeout_ms: u64,
    /// Fail an Item whose closure lists its own id instead of ignoring
    /// that entry.
    pub reject_self_cycles: bool,
}

impl DefermentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DefermentConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            reject_self_cycles: true,
        }
    }
}

/// What one call changed.
#[derive(Debug, Default)]
pub struct Advance {
    /// Items released, children before parents.
    pub emitted: Vec<Item>,
    /// Closure ids seen for the first time; the caller must resolve them.
    pub requests: Vec<BaseId>,
    /// Ids that will never be released.
    pub failed: Vec<(BaseId, DeferError)>,
}

impl Advance {
    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty() && self.requests.is_empty() && self.failed.is_empty()
    }
}

/// A resolved Item held until its closure clears.
#[derive(Debug)]
struct Entry {
    item: Item,
    pending: HashSet<BaseId>,
}

/// Per-session dependency bookkeeping.
#[derive(Debug, Default)]
pub struct DefermentManager {
    config: DefermentConfig,
    /// Held Items by id.
    entries: HashMap<BaseId, Entry>,
    /// Reverse index: child id -> held Items waiting on it.
    waiters: HashMap<BaseId, HashSet<BaseId>>,
    emitted: HashSet<BaseId>,
    requested: HashSet<BaseId>,
    failed: HashMap<BaseId, DeferError>,
}

impl DefermentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DefermentConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &DefermentConfig {
        &self.config
    }

    /// Record that `id` is being resolved. Returns `true` only the first
    /// time, so each id is requested once per session.
    pub fn mark_requested(&mut self, id: &BaseId) -> bool {
        if self.requested.contains(id) {
            return false;
        }
        self.requested.insert(id.clone())
    }

    /// Take a resolved Item. Releases it, and any held ancestors it was
    /// the last blocker of, or holds it until its closure clears.
    pub fn accept(&mut self, item: Item) -> Advance {
        let mut advance = Advance::default();
        let id = item.base_id.clone();
        if self.emitted.contains(&id) || self.entries.contains_key(&id) || self.failed.contains_key(&id) {
            trace!(id = %id, "duplicate arrival ignored");
            return advance;
        }
        self.requested.insert(id.clone());

        let mut pending = HashSet::new();
        let mut blocked_by: Option<(BaseId, DeferError)> = None;
        for child in item.base.children() {
            if child == &id {
                if self.config.reject_self_cycles {
                    blocked_by = Some((
                        id.clone(),
                        DeferError::CycleOrMissingDependency {
                            id: id.clone(),
                            reason: "closure lists its own id".into(),
                        },
                    ));
                    break;
                }
                continue;
            }
            if self.emitted.contains(child) {
                continue;
            }
            if let Some(err) = self.failed.get(child) {
                blocked_by = Some((child.clone(), err.propagate_to(&id)));
                break;
            }
            pending.insert(child.clone());
        }

        if let Some((cause, err)) = blocked_by {
            debug!(id = %id, cause = %cause, "arrival blocked by a failed dependency");
            advance.failed = self.fail(&id, err);
            return advance;
        }

        // With transitive closures every cycle is a mutual wait.
        if let Some(other) = pending
            .iter()
            .find(|child| self.entries.get(*child).is_some_and(|e| e.pending.contains(&id)))
            .cloned()
        {
            warn!(id = %id, other = %other, "dependency cycle detected");
            let err = DeferError::CycleOrMissingDependency {
                id: id.clone(),
                reason: format!("{id} and {other} wait on each other"),
            };
            advance.failed = self.fail(&id, err);
            return advance;
        }

        for child in &pending {
            self.waiters.entry(child.clone()).or_default().insert(id.clone());
            if self.mark_requested(child) {
                advance.requests.push(child.clone());
            }
        }

        let ready = pending.is_empty();
        if !ready {
            trace!(id = %id, pending = pending.len(), "holding item");
        }
        self.entries.insert(id.clone(), Entry { item, pending });
        if ready {
            advance.emitted = self.release(id);
        }
        advance
    }

    /// Release `start` and every held ancestor that becomes ready.
    fn release(&mut self, start: BaseId) -> Vec<Item> {
        let mut out = Vec::new();
        let mut ready = vec![start];
        while let Some(id) = ready.pop() {
            let Some(entry) = self.entries.remove(&id) else {
                continue;
            };
            self.emitted.insert(id.clone());
            out.push(entry.item);

            let Some(parents) = self.waiters.remove(&id) else {
                continue;
            };
            for parent in parents {
                if let Some(held) = self.entries.get_mut(&parent) {
                    held.pending.remove(&id);
                    if held.pending.is_empty() {
                        ready.push(parent);
                    }
                }
            }
        }
        out
    }

    /// Fail `id` and every held Item transitively waiting on it. Returns
    /// each failed id with its error, `id` first.
    pub fn fail(&mut self, id: &BaseId, err: DeferError) -> Vec<(BaseId, DeferError)> {
        if self.emitted.contains(id) || self.failed.contains_key(id) {
            return Vec::new();
        }
        self.entries.remove(id);
        self.failed.insert(id.clone(), err.clone());

        let mut out = vec![(id.clone(), err.clone())];
        let mut queue = VecDeque::from([(id.clone(), err)]);
        while let Some((child, child_err)) = queue.pop_front() {
            let Some(parents) = self.waiters.remove(&child) else {
                continue;
            };
            for parent in parents {
                if self.entries.remove(&parent).is_none() {
                    continue;
                }
                let parent_err = child_err.propagate_to(&parent);
                self.failed.insert(parent.clone(), parent_err.clone());
                out.push((parent.clone(), parent_err.clone()));
                queue.push_back((parent, parent_err));
            }
        }
        debug!(id = %id, failed = out.len(), "dependency failure propagated");
        out
    }

    /// Fail every held Item, e.g. when the graph stopped making progress.
    pub fn fail_all_pending(&mut self, reason: &str) -> Vec<(BaseId, DeferError)> {
        let mut held: Vec<BaseId> = self.entries.keys().cloned().collect();
        held.sort();
        let mut out = Vec::with_capacity(held.len());
        for id in held {
            if self.entries.remove(&id).is_none() {
                continue;
            }
            let err = DeferError::CycleOrMissingDependency {
                id: id.clone(),
                reason: reason.to_string(),
            };
            self.failed.insert(id.clone(), err.clone());
            out.push((id, err));
        }
        self.waiters.clear();
        out
    }

    /// Held Items.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_emitted(&self, id: &BaseId) -> bool {
        self.emitted.contains(id)
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted.len()
    }

    pub fn failure(&self, id: &BaseId) -> Option<&DeferError> {
        self.failed.get(id)
    }

    /// Closure ids a held Item is still waiting on.
    pub fn blockers(&self, id: &BaseId) -> Option<Vec<BaseId>> {
        self.entries.get(id).map(|e| {
            let mut ids: Vec<BaseId> = e.pending.iter().cloned().collect();
            ids.sort();
            ids
        })
    }

    /// Nothing held.
    pub fn is_idle(&self) -> bool {
        self.entries.is_empty()
    }
}
