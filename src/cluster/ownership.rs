//! Index Ownership Resolution
//!
//! Single source of truth for "which member currently owns writes to index
//! X". Ownership is derived from the current [`View`] through a pluggable
//! [`OwnerSelector`], plus optional administrative overrides.
//!
//! The current assignment is an immutable snapshot behind an `Arc`; writers
//! swap the whole snapshot under a short write lock and readers clone the
//! `Arc`, so a reader never observes a half-applied view.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use super::membership::{ClusterNode, View};

/// Owner of an index for the current view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// No view yet, or no eligible member in the current view
    Unknown,
    /// This node owns the index
    Local,
    /// Another member owns the index
    Remote(ClusterNode),
}

/// Strategy picking the owner of an index among the members of a view
pub trait OwnerSelector: Send + Sync {
    fn select<'v>(&self, index_name: &str, view: &'v View) -> Option<&'v ClusterNode>;
}

/// First alive member in canonical (node id) order owns every index
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstMemberSelector;

impl OwnerSelector for FirstMemberSelector {
    fn select<'v>(&self, _index_name: &str, view: &'v View) -> Option<&'v ClusterNode> {
        view.alive().next()
    }
}

/// Highest-random-weight hashing: spreads indexes over alive members and
/// moves only the indexes of a departed member when membership changes
#[derive(Debug, Default, Clone, Copy)]
pub struct RendezvousSelector;

impl RendezvousSelector {
    fn weight(node_id: &str, index_name: &str) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(node_id.as_bytes());
        hasher.write_u8(0);
        hasher.write(index_name.as_bytes());
        hasher.finish()
    }
}

impl OwnerSelector for RendezvousSelector {
    fn select<'v>(&self, index_name: &str, view: &'v View) -> Option<&'v ClusterNode> {
        // Ties resolve to the first node in canonical order
        view.alive().fold(None, |best: Option<(u64, &ClusterNode)>, node| {
            let weight = Self::weight(&node.node_id, index_name);
            match best {
                Some((best_weight, _)) if best_weight >= weight => best,
                _ => Some((weight, node)),
            }
        })
        .map(|(_, node)| node)
    }
}

/// Configured owner selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipStrategy {
    #[default]
    FirstMember,
    Rendezvous,
}

impl OwnershipStrategy {
    pub fn selector(self) -> Box<dyn OwnerSelector> {
        match self {
            OwnershipStrategy::FirstMember => Box::new(FirstMemberSelector),
            OwnershipStrategy::Rendezvous => Box::new(RendezvousSelector),
        }
    }
}

/// Published assignment state
#[derive(Debug, Default)]
struct Assignment {
    /// `None` until the first view arrives
    view: Option<Arc<View>>,
    /// index name -> node id
    overrides: HashMap<String, String>,
}

/// Resolves index ownership for the local node
pub struct OwnershipResolver {
    local_node_id: String,
    selector: Box<dyn OwnerSelector>,
    current: RwLock<Arc<Assignment>>,
}

impl OwnershipResolver {
    pub fn new(local_node_id: impl Into<String>, selector: Box<dyn OwnerSelector>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            selector,
            current: RwLock::new(Arc::new(Assignment::default())),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Install a new view
    ///
    /// Returns `false` when the view has the same membership as the installed
    /// one, in which case nothing changes.
    pub fn on_view_change(&self, view: Arc<View>) -> bool {
        let mut current = self.current.write();
        if let Some(installed) = &current.view {
            if installed.same_membership(&view) {
                debug!("Ownership: {} unchanged, keeping {}", view, installed);
                return false;
            }
        }

        info!("Ownership: installing {}", view);
        *current = Arc::new(Assignment {
            view: Some(view),
            overrides: current.overrides.clone(),
        });
        true
    }

    /// Forget the installed view; every index becomes Unknown
    pub fn reset(&self) {
        let mut current = self.current.write();
        *current = Arc::new(Assignment {
            view: None,
            overrides: current.overrides.clone(),
        });
    }

    /// Pin an index to a node regardless of the selection strategy
    pub fn assign(&self, index_name: &str, node_id: &str) {
        let mut current = self.current.write();
        let mut overrides = current.overrides.clone();
        overrides.insert(index_name.to_string(), node_id.to_string());
        info!("Ownership: index '{}' pinned to '{}'", index_name, node_id);
        *current = Arc::new(Assignment {
            view: current.view.clone(),
            overrides,
        });
    }

    /// Remove an override, returning the index to the selection strategy
    pub fn clear_assignment(&self, index_name: &str) -> bool {
        let mut current = self.current.write();
        if !current.overrides.contains_key(index_name) {
            return false;
        }
        let mut overrides = current.overrides.clone();
        overrides.remove(index_name);
        *current = Arc::new(Assignment {
            view: current.view.clone(),
            overrides,
        });
        true
    }

    /// Currently installed view, if any
    pub fn current_view(&self) -> Option<Arc<View>> {
        self.current.read().view.clone()
    }

    /// Resolve the owner of an index
    pub fn ownership(&self, index_name: &str) -> Ownership {
        let snapshot = self.current.read().clone();
        let Some(view) = snapshot.view.as_deref() else {
            return Ownership::Unknown;
        };

        let owner = match snapshot.overrides.get(index_name) {
            Some(node_id) => view.node(node_id).filter(|n| n.is_alive()),
            None => self.selector.select(index_name, view),
        };

        match owner {
            None => Ownership::Unknown,
            Some(node) if node.node_id == self.local_node_id => Ownership::Local,
            Some(node) => Ownership::Remote(node.clone()),
        }
    }

    /// Whether this node owns writes to the index; `false` while Unknown
    pub fn is_owner_local(&self, index_name: &str) -> bool {
        self.ownership(index_name) == Ownership::Local
    }
}
