//! Routing ids and the per-channel routing table.
//!
//! Many logical objects share one channel. Each is addressed by a `RoutingId`;
//! the table maps ids to the listener that handles their messages. Ids come
//! from two disjoint blocks so both ends can allocate without coordinating:
//!
//! ```text
//! [0, 0x10000)              client-allocated
//! [0x10000, u32::MAX)       host-allocated
//! u32::MAX                  control (handled by the peer itself)
//! ```
//!
//! The table is owned by exactly one peer and used from its control thread
//! only, so it carries no locking.

use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Per-channel identifier of a logical object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RoutingId(pub u32);

impl RoutingId {
    /// Sentinel addressing the peer itself rather than a routed listener.
    pub const CONTROL: RoutingId = RoutingId(u32::MAX);
    /// First id of the host-allocated block.
    pub const HOST_BASE: RoutingId = RoutingId(0x10000);

    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }

    pub fn is_host_allocated(&self) -> bool {
        !self.is_control() && *self >= Self::HOST_BASE
    }

    pub fn is_client_allocated(&self) -> bool {
        *self < Self::HOST_BASE
    }
}

impl std::fmt::Display for RoutingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_control() {
            write!(f, "control")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Monotonic allocator over one routing-id block.
///
/// Ids are never handed out twice; a stale message for a torn-down object
/// must not reach a newer object that happens to reuse its id.
#[derive(Debug, Clone)]
pub struct RoutingIdAllocator {
    next: u32,
    end: u32,
}

impl RoutingIdAllocator {
    /// Allocator for the client block, starting at 0.
    pub fn client() -> Self {
        Self {
            next: 0,
            end: RoutingId::HOST_BASE.0,
        }
    }

    /// Allocator for the host block, starting at `RoutingId::HOST_BASE`.
    pub fn host() -> Self {
        Self {
            next: RoutingId::HOST_BASE.0,
            end: RoutingId::CONTROL.0,
        }
    }

    /// Hand out the next unused id of this block.
    pub fn allocate(&mut self) -> Result<RoutingId> {
        if self.next >= self.end {
            return Err(LinkError::RoutingIdsExhausted);
        }
        let id = RoutingId(self.next);
        self.next += 1;
        Ok(id)
    }
}

/// Map from routing id to the listener handling that id.
#[derive(Debug)]
pub struct RoutingTable<L> {
    routes: HashMap<RoutingId, L>,
}

impl<L> Default for RoutingTable<L> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<L> RoutingTable<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` at `id`.
    ///
    /// An id that is already registered keeps its listener and the call
    /// fails with `RouteExists`.
    pub fn add(&mut self, id: RoutingId, listener: L) -> Result<()> {
        if id.is_control() || self.routes.contains_key(&id) {
            return Err(LinkError::RouteExists(id));
        }
        self.routes.insert(id, listener);
        debug!("Added route: routing_id({})", id);
        Ok(())
    }

    /// Unregister `id`, handing the listener back. Unknown ids are a no-op.
    pub fn remove(&mut self, id: RoutingId) -> Option<L> {
        let removed = self.routes.remove(&id);
        if removed.is_some() {
            debug!("Removed route: routing_id({})", id);
        }
        removed
    }

    pub fn lookup(&self, id: RoutingId) -> Option<&L> {
        self.routes.get(&id)
    }

    pub fn lookup_mut(&mut self, id: RoutingId) -> Option<&mut L> {
        self.routes.get_mut(&id)
    }

    pub fn contains(&self, id: RoutingId) -> bool {
        self.routes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Remove every route, in ascending id order.
    pub fn drain(&mut self) -> Vec<(RoutingId, L)> {
        let mut drained: Vec<_> = self.routes.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }
}
