use crate::protocol::{NodeIdentity, RegistryEntry, Role};
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info};

/// Identifies the connection a registration arrived on
pub type SessionId = u64;

#[derive(Debug, Clone)]
struct Registration {
    entry: RegistryEntry,
    session: SessionId,
}

/// The registry's directory of nodes, owned by the registry actor alone
#[derive(Debug, Default)]
pub struct Directory {
    nodes: HashMap<NodeIdentity, Registration>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry for `identity`
    pub fn register(
        &mut self,
        identity: NodeIdentity,
        role: Role,
        session: SessionId,
    ) -> RegistryEntry {
        let entry = RegistryEntry {
            identity: identity.clone(),
            role,
            registered_at: Utc::now(),
        };

        match self.nodes.insert(
            identity.clone(),
            Registration {
                entry: entry.clone(),
                session,
            },
        ) {
            Some(previous) => info!(
                node = %identity,
                role = %role,
                previous_role = %previous.entry.role,
                "Node re-registered"
            ),
            None => info!(node = %identity, role = %role, "Node registered"),
        }

        entry
    }

    /// Remove the entry if present, returns whether something was removed
    pub fn unregister(&mut self, identity: &NodeIdentity) -> bool {
        let removed = self.nodes.remove(identity).is_some();
        if removed {
            info!(node = %identity, "Node unregistered");
        }

        removed
    }

    /// Remove the entry only if it still belongs to `session`. A node that re-registered on
    /// a newer connection keeps its entry when the older connection goes away.
    pub fn session_lost(&mut self, identity: &NodeIdentity, session: SessionId) -> bool {
        match self.nodes.get(identity) {
            Some(registration) if registration.session == session => {
                self.nodes.remove(identity);
                info!(node = %identity, session, "Lost contact with node, unregistered");

                true
            }
            Some(registration) => {
                debug!(
                    node = %identity,
                    lost = session,
                    current = registration.session,
                    "Ignoring loss of superseded session"
                );

                false
            }
            None => false,
        }
    }

    pub fn list_by_role(&self, role: Role) -> Vec<NodeIdentity> {
        self.nodes
            .values()
            .filter(|registration| registration.entry.role == role)
            .map(|registration| registration.entry.identity.clone())
            .collect()
    }

    pub fn get(&self, identity: &NodeIdentity) -> Option<&RegistryEntry> {
        self.nodes.get(identity).map(|registration| &registration.entry)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
