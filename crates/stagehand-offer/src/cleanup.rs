//! Orphan reservation cleanup.
//!
//! A reservation made under the service's role that no stored task (or its
//! executor) references anymore is released: persistent volumes are
//! destroyed first, then every orphaned reservation is unreserved.

use std::collections::HashSet;

use stagehand_core::{Offer, Operation, TaskInfo};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ResourceCleaner {
    role: String,
    expected_resource_ids: HashSet<String>,
    expected_persistence_ids: HashSet<String>,
}

impl ResourceCleaner {
    /// Build a cleaner that keeps every reservation referenced by `tasks`.
    pub fn new<'a>(role: &str, tasks: impl IntoIterator<Item = &'a TaskInfo>) -> Self {
        let mut expected_resource_ids = HashSet::new();
        let mut expected_persistence_ids = HashSet::new();
        for task in tasks {
            expected_resource_ids.extend(task.resource_ids().map(str::to_string));
            expected_persistence_ids.extend(task.persistence_ids().map(str::to_string));
        }
        Self {
            role: role.to_string(),
            expected_resource_ids,
            expected_persistence_ids,
        }
    }

    /// Operations releasing the orphaned reservations in `offer`, destroys first.
    pub fn operations(&self, offer: &Offer) -> Vec<Operation> {
        let mut destroys = Vec::new();
        let mut unreserves = Vec::new();
        for resource in offer.reserved().filter(|r| r.role() == Some(self.role.as_str())) {
            let orphaned_volume = resource
                .persistence_id()
                .is_some_and(|id| !self.expected_persistence_ids.contains(id));
            if orphaned_volume {
                destroys.push(Operation::Destroy {
                    volume: resource.clone(),
                });
            }
            let orphaned = resource
                .resource_id()
                .is_some_and(|id| !self.expected_resource_ids.contains(id));
            if orphaned {
                let mut released = resource.clone();
                released.disk = None;
                unreserves.push(Operation::Unreserve { resource: released });
            }
        }
        if !destroys.is_empty() || !unreserves.is_empty() {
            info!(
                offer = %offer.id,
                destroys = destroys.len(),
                unreserves = unreserves.len(),
                "releasing orphaned reservations"
            );
        }
        destroys.extend(unreserves);
        destroys
    }
}
