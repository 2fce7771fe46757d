use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::model::{ContainerId, Signature};

#[derive(Debug, Default)]
struct References {
    by_signature: HashMap<Signature, HashSet<ContainerId>>,
    by_container: HashMap<ContainerId, HashSet<Signature>>,
    /// Every container that was ever indexed.
    indexed: HashSet<ContainerId>,
}

impl References {
    /// Drops one edge, and the container's entry if that was its last dependent.
    fn unlink_container(&mut self, signature: &Signature, container: &ContainerId) -> bool {
        let Entry::Occupied(mut dependents) = self.by_container.entry(*container) else {
            return false;
        };
        dependents.get_mut().remove(signature);
        if dependents.get().is_empty() {
            dependents.remove();
            return true;
        }
        false
    }
}

/// Which files depend on which containers, and the other way around.
///
/// A container has an entry in the dependents map iff at least one signature
/// still depends on it.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    inner: RwLock<References>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Signature, ContainerId)>) -> Self {
        let index = Self::new();
        {
            let mut inner = index.inner.write();
            for (signature, container) in pairs {
                link(&mut inner, signature, container);
            }
        }
        index
    }

    /// The signatures that currently depend on `container`.
    pub fn keys_for(&self, container: &ContainerId) -> HashSet<Signature> {
        self.inner
            .read()
            .by_container
            .get(container)
            .cloned()
            .unwrap_or_default()
    }

    /// Detaches `signature` from every container it depends on.
    ///
    /// Returns the containers that were left without any dependent. Removing
    /// an unknown signature is a no-op.
    pub fn remove_key(&self, signature: &Signature) -> Vec<ContainerId> {
        let mut inner = self.inner.write();
        let Some(containers) = inner.by_signature.remove(signature) else {
            return vec![];
        };
        containers
            .into_iter()
            .filter(|container| inner.unlink_container(signature, container))
            .collect()
    }

    /// Every container ever indexed, satisfied or not.
    pub fn value_set(&self) -> HashSet<ContainerId> {
        self.inner.read().indexed.clone()
    }

    pub fn key_count(&self) -> usize {
        self.inner.read().by_signature.len()
    }
}

fn link(inner: &mut References, signature: Signature, container: ContainerId) {
    inner
        .by_signature
        .entry(signature)
        .or_default()
        .insert(container);
    inner
        .by_container
        .entry(container)
        .or_default()
        .insert(signature);
    inner.indexed.insert(container);
}
