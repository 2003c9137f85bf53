//! Scripted fault plans for the in-memory remote.
//!
//! A [`FaultPlan`] is a list of failures armed on a [`MemoryRemote`] in one
//! go, so a scenario reads as "this is what the network does" before the
//! pass runs.

use proptest::prelude::*;
use threadsync_engine::{Fault, FaultTarget, MemoryRemote};

/// One planned failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFault {
    /// Call the fault applies to.
    pub target: FaultTarget,
    /// Restricts the fault to one path.
    pub path: Option<String>,
    /// The failure itself.
    pub fault: Fault,
}

/// An ordered list of failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    faults: Vec<PlannedFault>,
}

impl FaultPlan {
    /// Creates an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next call to `target`.
    pub fn fail(mut self, target: FaultTarget, fault: Fault) -> Self {
        self.faults.push(PlannedFault {
            target,
            path: None,
            fault,
        });
        self
    }

    /// Fails the next call to `target` for `path`.
    pub fn fail_for(mut self, target: FaultTarget, path: &str, fault: Fault) -> Self {
        self.faults.push(PlannedFault {
            target,
            path: Some(path.to_string()),
            fault,
        });
        self
    }

    /// Fails the next `times` calls to `target`.
    pub fn fail_times(mut self, target: FaultTarget, fault: Fault, times: usize) -> Self {
        for _ in 0..times {
            self = self.fail(target, fault.clone());
        }
        self
    }

    /// Returns the planned faults in order.
    pub fn faults(&self) -> &[PlannedFault] {
        &self.faults
    }

    /// Returns whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// Arms every planned fault on `remote`.
    pub fn arm(&self, remote: &MemoryRemote) {
        for planned in &self.faults {
            match &planned.path {
                Some(path) => remote.fail_next_for(planned.target, path, planned.fault.clone()),
                None => remote.fail_next(planned.target, planned.fault.clone()),
            }
        }
    }
}

/// Strategy for transient faults: ones a retrying engine recovers from.
pub fn transient_fault_strategy() -> impl Strategy<Value = Fault> {
    prop_oneof![
        Just(Fault::Network),
        Just(Fault::Timeout),
        Just(Fault::Status(503)),
        Just(Fault::LostResponse),
        (0u64..5).prop_map(|retry_after_ms| Fault::RateLimited { retry_after_ms }),
    ]
}

/// Strategy for call targets.
pub fn fault_target_strategy() -> impl Strategy<Value = FaultTarget> {
    prop_oneof![
        Just(FaultTarget::Manifest),
        Just(FaultTarget::Download),
        Just(FaultTarget::Chunk),
        Just(FaultTarget::Commit),
        Just(FaultTarget::Delete),
    ]
}

/// Strategy for plans of up to `max_faults` transient failures.
pub fn transient_plan_strategy(max_faults: usize) -> impl Strategy<Value = FaultPlan> {
    prop::collection::vec((fault_target_strategy(), transient_fault_strategy()), 0..=max_faults)
        .prop_map(|faults| {
            faults
                .into_iter()
                .fold(FaultPlan::new(), |plan, (target, fault)| plan.fail(target, fault))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_keeps_order() {
        let plan = FaultPlan::new()
            .fail(FaultTarget::Manifest, Fault::Timeout)
            .fail_for(FaultTarget::Download, "a.txt", Fault::Corrupt)
            .fail_times(FaultTarget::Commit, Fault::Status(503), 2);

        assert_eq!(plan.faults().len(), 4);
        assert_eq!(plan.faults()[1].path.as_deref(), Some("a.txt"));
        assert_eq!(plan.faults()[3].fault, Fault::Status(503));
    }

    proptest! {
        #[test]
        fn generated_plans_respect_bound(plan in transient_plan_strategy(3)) {
            prop_assert!(plan.faults().len() <= 3);
            for planned in plan.faults() {
                prop_assert!(planned.path.is_none());
            }
        }
    }
}
