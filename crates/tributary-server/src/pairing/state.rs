//! Pending change state machine.
//!
//! `Proposed → Confirmed | Rejected | Expired`, one way. At most one change
//! is `Proposed` at a time; a new proposal expires the previous one.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tributary_plugin::canonical_key;
use uuid::Uuid;

/// Terminal changes kept around for status polling.
const MAX_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeState {
    Proposed,
    Confirmed,
    Rejected,
    Expired,
}

impl ChangeState {
    pub fn is_terminal(self) -> bool {
        self != Self::Proposed
    }
}

/// Repository URLs a change would install and uninstall.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangeDiff {
    /// Compare a proposed URL list with the installed one, ignoring case and
    /// trailing slashes.
    pub fn between(current: &[String], proposed: &[String]) -> Self {
        let current_keys: BTreeSet<String> = current.iter().map(|u| canonical_key(u)).collect();
        let proposed_keys: BTreeSet<String> = proposed.iter().map(|u| canonical_key(u)).collect();
        Self {
            added: proposed
                .iter()
                .filter(|u| !current_keys.contains(&canonical_key(u)))
                .cloned()
                .collect(),
            removed: current
                .iter()
                .filter(|u| !proposed_keys.contains(&canonical_key(u)))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub change_id: Uuid,
    pub proposed_repository_urls: Vec<String>,
    /// Remote address of the device that submitted the change.
    pub proposer: String,
    pub diff: ChangeDiff,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ChangeState,
}

impl PendingChange {
    fn url_set(&self) -> BTreeSet<String> {
        self.proposed_repository_urls
            .iter()
            .map(|u| canonical_key(u))
            .collect()
    }
}

/// Result of [`PairingState::propose`].
#[derive(Debug, Clone)]
pub struct Proposal {
    pub change: PendingChange,
    /// Id of the change this one expired, if any.
    pub superseded: Option<Uuid>,
    /// True when an identical live proposal was extended instead.
    pub refreshed: bool,
}

#[derive(Debug)]
pub struct PairingState {
    ttl: Duration,
    /// Newest last. Holds the live change, if any, plus recent history.
    changes: VecDeque<PendingChange>,
}

impl PairingState {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(10)),
            changes: VecDeque::new(),
        }
    }

    fn find_mut(&mut self, id: Uuid) -> Option<&mut PendingChange> {
        self.changes.iter_mut().find(|c| c.change_id == id)
    }

    /// Move a proposal past its expiry to `Expired`.
    fn expire_stale(&mut self, now: DateTime<Utc>) {
        for change in self.changes.iter_mut() {
            if change.state == ChangeState::Proposed && now >= change.expires_at {
                tracing::debug!(change = %change.change_id, "pending change expired");
                change.state = ChangeState::Expired;
            }
        }
    }

    fn trim_history(&mut self) {
        while self.changes.len() > MAX_HISTORY {
            let Some(pos) = self.changes.iter().position(|c| c.state.is_terminal()) else {
                break;
            };
            self.changes.remove(pos);
        }
    }

    /// Record a new proposal. `urls` must already be canonical.
    pub fn propose(
        &mut self,
        urls: Vec<String>,
        proposer: &str,
        current: &[String],
        now: DateTime<Utc>,
    ) -> Proposal {
        self.expire_stale(now);
        let ttl = self.ttl;
        let wanted: BTreeSet<String> = urls.iter().map(|u| canonical_key(u)).collect();

        let mut superseded = None;
        if let Some(live) = self
            .changes
            .iter_mut()
            .find(|c| c.state == ChangeState::Proposed)
        {
            if live.proposer == proposer && live.url_set() == wanted {
                live.expires_at = now + ttl;
                return Proposal {
                    change: live.clone(),
                    superseded: None,
                    refreshed: true,
                };
            }
            live.state = ChangeState::Expired;
            superseded = Some(live.change_id);
        }

        let change = PendingChange {
            change_id: Uuid::new_v4(),
            diff: ChangeDiff::between(current, &urls),
            proposed_repository_urls: urls,
            proposer: proposer.to_string(),
            created_at: now,
            expires_at: now + ttl,
            state: ChangeState::Proposed,
        };
        self.changes.push_back(change.clone());
        self.trim_history();

        Proposal {
            change,
            superseded,
            refreshed: false,
        }
    }

    /// The change with `id`, with expiry applied.
    pub fn get(&mut self, id: Uuid, now: DateTime<Utc>) -> Option<PendingChange> {
        self.expire_stale(now);
        self.changes.iter().find(|c| c.change_id == id).cloned()
    }

    /// The live proposal, if one is still confirmable.
    pub fn live(&mut self, now: DateTime<Utc>) -> Option<PendingChange> {
        self.expire_stale(now);
        self.changes
            .iter()
            .find(|c| c.state == ChangeState::Proposed)
            .cloned()
    }

    /// Move the live change `id` to the terminal state `to`.
    ///
    /// Returns `None`, changing nothing, when `id` is unknown or already
    /// terminal.
    pub fn resolve(
        &mut self,
        id: Uuid,
        to: ChangeState,
        now: DateTime<Utc>,
    ) -> Option<PendingChange> {
        debug_assert!(to.is_terminal());
        self.expire_stale(now);
        let change = self.find_mut(id)?;
        if change.state.is_terminal() {
            return None;
        }
        change.state = to;
        Some(change.clone())
    }

    /// Expire whatever is live. Used on shutdown.
    pub fn expire_live(&mut self) -> Option<Uuid> {
        let live = self
            .changes
            .iter_mut()
            .find(|c| c.state == ChangeState::Proposed)?;
        live.state = ChangeState::Expired;
        Some(live.change_id)
    }
}
