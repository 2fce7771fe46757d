use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::model::{ReassemblyPlan, Signature};

/// The plans of all files that have not been written yet.
///
/// Taking a plan out of here is what grants the right to write its file.
#[derive(Debug, Default)]
pub struct PlanIndex {
    plans: DashMap<Signature, Arc<ReassemblyPlan>>,
}

impl PlanIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signature: &Signature) -> Option<Arc<ReassemblyPlan>> {
        self.plans.get(signature).map(|plan| Arc::clone(plan.value()))
    }

    /// Removes the plan if it is still pending.
    ///
    /// Of any number of concurrent callers for the same signature, exactly one
    /// gets `Some`.
    pub fn claim(&self, signature: &Signature) -> Option<Arc<ReassemblyPlan>> {
        self.plans.remove(signature).map(|(_, plan)| plan)
    }

    /// Puts a claimed plan back, e.g. after its write failed. Returns `false`
    /// if a plan for that signature is already pending.
    pub fn restore(&self, plan: Arc<ReassemblyPlan>) -> bool {
        match self.plans.entry(plan.signature) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(plan);
                true
            }
        }
    }

    pub fn pending(&self) -> HashSet<Signature> {
        self.plans.iter().map(|entry| *entry.key()).collect()
    }

    pub fn plans(&self) -> Vec<Arc<ReassemblyPlan>> {
        self.plans
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

impl FromIterator<ReassemblyPlan> for PlanIndex {
    fn from_iter<I: IntoIterator<Item = ReassemblyPlan>>(plans: I) -> Self {
        Self {
            plans: plans
                .into_iter()
                .map(|plan| (plan.signature, Arc::new(plan)))
                .collect(),
        }
    }
}
