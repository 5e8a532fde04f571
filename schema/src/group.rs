//! Group lifecycle states and aggregated run results

use crate::Rank;
use crate::worker::ProcessFailure;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a process group
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum GroupState {
    /// Group is constructed but no rank has been spawned yet
    Created,
    /// All ranks have been spawned and are being monitored
    Running,
    /// A shutdown sequence is in progress
    Terminating,
    /// All ranks have been reaped and the final result is cached
    Terminated,
}

impl GroupState {
    /// Check if the group has live processes to account for
    pub fn is_live(&self) -> bool {
        matches!(self, GroupState::Running | GroupState::Terminating)
    }

    /// Check if the group has reached its absorbing final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupState::Terminated)
    }

    /// Check if `start()` is still permitted
    pub fn can_start(&self) -> bool {
        matches!(self, GroupState::Created)
    }
}

/// Aggregated terminal outcome of a process group's wait cycle.
///
/// Ranks that exited 0 appear in `return_values`; ranks that terminated
/// abnormally appear in `failures`. The two key sets are disjoint. Once the
/// group is fully terminated every started rank appears in exactly one of the
/// mappings; a rank present in neither means it was still running when the
/// result was taken.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Success value per rank that exited 0
    pub return_values: BTreeMap<Rank, serde_json::Value>,
    /// Failure record per rank that terminated abnormally
    pub failures: BTreeMap<Rank, ProcessFailure>,
}

impl RunResult {
    /// Whether any rank failed
    #[must_use]
    pub fn is_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Number of ranks accounted for in this result
    #[must_use]
    pub fn settled_ranks(&self) -> usize {
        self.return_values.len() + self.failures.len()
    }

    /// Whether every one of `world_size` started ranks has a terminal outcome
    #[must_use]
    pub fn is_complete(&self, world_size: usize) -> bool {
        self.settled_ranks() == world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_state_predicates() {
        assert!(GroupState::Created.can_start());
        assert!(!GroupState::Created.is_live());
        assert!(!GroupState::Created.is_terminal());

        assert!(GroupState::Running.is_live());
        assert!(!GroupState::Running.can_start());

        assert!(GroupState::Terminating.is_live());
        assert!(!GroupState::Terminating.is_terminal());

        assert!(GroupState::Terminated.is_terminal());
        assert!(!GroupState::Terminated.is_live());
        assert!(!GroupState::Terminated.can_start());
    }

    #[test]
    fn test_run_result_empty_is_not_failed() {
        let result = RunResult::default();
        assert!(!result.is_failed());
        assert_eq!(result.settled_ranks(), 0);
        assert!(result.is_complete(0));
        assert!(!result.is_complete(2));
    }

    #[test]
    fn test_run_result_with_failure() {
        let mut result = RunResult::default();
        result
            .return_values
            .insert(0, serde_json::Value::Null);
        result.failures.insert(
            1,
            ProcessFailure::from_code(1, 4321, 2, "worker exited with code 2".into()),
        );

        assert!(result.is_failed());
        assert_eq!(result.settled_ranks(), 2);
        assert!(result.is_complete(2));
    }

    #[test]
    fn test_run_result_json_keys_are_ranks() {
        let mut result = RunResult::default();
        result
            .return_values
            .insert(3, serde_json::json!({"loss": 0.25}));
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"returnValues\":{\"3\":{\"loss\":0.25}}"));
    }
}
