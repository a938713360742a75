//! Process-wide group claims
//!
//! At most one connection may bind a given group at a time. The check and
//! the insert happen under the same map shard lock, so two racing claims
//! cannot both succeed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::error::CoordinationError;
use crate::transport::GroupId;

/// Identity of one connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ManagerId(Uuid);

impl ManagerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ManagerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group -> claiming manager
#[derive(Debug, Default)]
pub struct CoordinationTable {
    claims: DashMap<GroupId, ManagerId>,
}

impl CoordinationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `group` for `manager`. Re-claiming a group the manager already
    /// holds succeeds.
    pub fn claim(&self, group: GroupId, manager: ManagerId) -> Result<(), CoordinationError> {
        match self.claims.entry(group) {
            Entry::Occupied(entry) if *entry.get() == manager => Ok(()),
            Entry::Occupied(entry) => Err(CoordinationError::AlreadyClaimed {
                group,
                holder: *entry.get(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(manager);
                tracing::debug!(group, %manager, "group claimed");
                Ok(())
            }
        }
    }

    /// Release `group` if, and only if, `manager` holds it
    pub fn release(&self, group: GroupId, manager: ManagerId) -> bool {
        let released = self
            .claims
            .remove_if(&group, |_, holder| *holder == manager)
            .is_some();
        if released {
            tracing::debug!(group, %manager, "group released");
        }
        released
    }

    pub fn holder(&self, group: GroupId) -> Option<ManagerId> {
        self.claims.get(&group).map(|entry| *entry.value())
    }

    pub fn is_claimed(&self, group: GroupId) -> bool {
        self.claims.contains_key(&group)
    }

    pub fn claimed_groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self.claims.iter().map(|entry| *entry.key()).collect();
        groups.sort_unstable();
        groups
    }

    /// The candidates nobody has claimed, in input order
    pub fn available<I>(&self, candidates: I) -> Vec<GroupId>
    where
        I: IntoIterator<Item = GroupId>,
    {
        candidates
            .into_iter()
            .filter(|group| !self.is_claimed(*group))
            .collect()
    }
}
