use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::errors::ShiftError;

pub mod catalog;

/// Consolidated per-shift ledger: composite task key to accumulated count.
///
/// Persisted as a single serialized record under the `TASKS` store key so
/// that a flush sees one consistent snapshot.
pub type Ledger = HashMap<String, i64>;

/// Composite counter address, stored as `<operator>_<taskName>`
/// (e.g. `lime_collectTroti`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub operator: String,
    pub task: String,
}

impl TaskKey {
    pub fn new(operator: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            task: task.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{}_{}", self.operator, self.task)
    }
}

impl FromStr for TaskKey {
    type Err = ShiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Operator ids never contain underscores; task names may.
        let (operator, task) = s
            .split_once('_')
            .ok_or_else(|| ShiftError::validation(format!("not a task key: {s}")))?;
        if operator.is_empty() || task.is_empty() {
            return Err(ShiftError::validation(format!("not a task key: {s}")));
        }
        Ok(Self::new(operator, task))
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// Applies one delta to the in-memory ledger and returns the new count.
///
/// Counts never go negative: the result is clamped to zero, matching what
/// the task-entry flow promises the worker ("you cannot have collected -1
/// scooters"). A zero result stays in the record so the close report can
/// still distinguish touched keys from untouched ones.
pub fn merge_delta(ledger: &mut Ledger, key: &TaskKey, delta: i64) -> i64 {
    let entry = ledger.entry(key.storage_key()).or_insert(0);
    *entry = (*entry + delta).max(0);
    *entry
}

/// Snapshot of all keys with a non-zero count, ordered for stable output.
pub fn flatten(ledger: &Ledger) -> BTreeMap<String, i64> {
    ledger
        .iter()
        .filter(|(_, count)| **count != 0)
        .map(|(key, count)| (key.clone(), *count))
        .collect()
}

pub fn serialize(ledger: &Ledger) -> Result<String, ShiftError> {
    serde_json::to_string(ledger).map_err(|e| ShiftError::storage(format!("encode ledger: {e}")))
}

pub fn deserialize(raw: Option<&str>) -> Result<Ledger, ShiftError> {
    match raw {
        None => Ok(Ledger::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ShiftError::storage(format!("decode ledger: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn key(s: &str) -> TaskKey {
        s.parse().unwrap()
    }

    #[test]
    fn delta_accumulates_per_key() {
        let mut ledger = Ledger::new();
        assert_eq!(merge_delta(&mut ledger, &key("lime_collectTroti"), 3), 3);
        assert_eq!(merge_delta(&mut ledger, &key("lime_collectTroti"), -1), 2);
        assert_eq!(merge_delta(&mut ledger, &key("bolt_swap"), 5), 5);
        assert_eq!(ledger["lime_collectTroti"], 2);
    }

    #[test]
    fn count_clamps_at_zero() {
        let mut ledger = Ledger::new();
        merge_delta(&mut ledger, &key("bird_deploy"), 2);
        assert_eq!(merge_delta(&mut ledger, &key("bird_deploy"), -10), 0);
        // Equivalent to max(0, sum of deltas), not a running clamp artifact.
        assert_eq!(merge_delta(&mut ledger, &key("bird_deploy"), 1), 1);
    }

    #[test]
    fn flatten_skips_zeroed_keys() {
        let mut ledger = Ledger::new();
        merge_delta(&mut ledger, &key("link_collect"), 4);
        merge_delta(&mut ledger, &key("link_deploy"), 1);
        merge_delta(&mut ledger, &key("link_deploy"), -1);
        let flat = flatten(&ledger);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat["link_collect"], 4);
    }

    #[test]
    fn task_key_round_trips_with_underscored_task_names() {
        let parsed = key("ridemovi_outsideFixedSwap");
        assert_eq!(parsed.operator, "ridemovi");
        assert_eq!(parsed.task, "outsideFixedSwap");
        assert_eq!(parsed.storage_key(), "ridemovi_outsideFixedSwap");
    }

    #[test]
    fn task_key_rejects_garbage() {
        assert!("lime".parse::<TaskKey>().is_err());
        assert!("_collect".parse::<TaskKey>().is_err());
        assert!("lime_".parse::<TaskKey>().is_err());
    }

    #[test]
    fn empty_ledger_deserializes_from_absent_record() {
        assert!(deserialize(None).unwrap().is_empty());
        let ledger = deserialize(Some(r#"{"lime_collectTroti":2}"#)).unwrap();
        assert_eq!(ledger["lime_collectTroti"], 2);
    }
}
