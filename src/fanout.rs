//! Fan-out splitting and aggregation
//!
//! Splitters are pure functions over `(payload, N)`; aggregators fold the
//! ordered sub-result sequence back into one parent result. Custom splitters
//! and reducers register per action. The parent lifecycle itself (tracking
//! children, cancelling siblings) lives in the hub; this module owns the
//! payload math.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::domain_types::ActionName;
use crate::tasks::{AggregatorKind, SplitStrategy};

/// Fan-out errors; all of them surface as validation failures on the parent
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("payload must be a list for {strategy:?} splitting")]
    PayloadNotAList { strategy: SplitStrategy },

    #[error("no custom splitter registered for action: {action}")]
    NoSplitter { action: ActionName },

    #[error("no custom reducer registered for action: {action}")]
    NoReducer { action: ActionName },

    #[error("custom splitter returned {got} payloads, expected {expected}")]
    WrongSplitArity { got: usize, expected: usize },

    #[error("sub-task result {index} is not a list; concat requires list results")]
    ConcatNonList { index: usize },

    #[error("sub-task result {index} is not a mapping; merge requires mapping results")]
    MergeNonMapping { index: usize },

    #[error("custom aggregation failed: {message}")]
    Custom { message: String },
}

/// Pure splitter: `(payload, n) -> n sub-payloads`
pub type SplitterFn = Arc<dyn Fn(&Value, usize) -> Result<Vec<Value>, FanoutError> + Send + Sync>;

/// Reducer over the ordered sub-result sequence
pub type ReducerFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, FanoutError> + Send + Sync>;

/// Per-action registry of custom splitters and reducers
#[derive(Default)]
pub struct FanoutRegistry {
    splitters: DashMap<ActionName, SplitterFn>,
    reducers: DashMap<ActionName, ReducerFn>,
}

impl FanoutRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom splitter for an action
    pub fn register_splitter(&self, action: ActionName, splitter: SplitterFn) {
        self.splitters.insert(action, splitter);
    }

    /// Registers a custom reducer for an action
    pub fn register_reducer(&self, action: ActionName, reducer: ReducerFn) {
        self.reducers.insert(action, reducer);
    }

    #[must_use]
    pub fn has_splitter(&self, action: &ActionName) -> bool {
        self.splitters.contains_key(action)
    }

    #[must_use]
    pub fn has_reducer(&self, action: &ActionName) -> bool {
        self.reducers.contains_key(action)
    }

    /// Splits a payload into `n` sub-payloads under the given strategy
    ///
    /// # Errors
    /// Returns `FanoutError` for non-list payloads on list strategies, a
    /// missing custom splitter, or a splitter arity mismatch.
    pub fn split(
        &self,
        strategy: SplitStrategy,
        action: &ActionName,
        payload: &Value,
        n: usize,
    ) -> Result<Vec<Value>, FanoutError> {
        match strategy {
            SplitStrategy::RoundRobin => round_robin(payload, n),
            SplitStrategy::LoadBalanced => load_balanced(payload, n),
            SplitStrategy::Broadcast => Ok(vec![payload.clone(); n]),
            SplitStrategy::Custom => {
                let splitter =
                    self.splitters
                        .get(action)
                        .ok_or_else(|| FanoutError::NoSplitter {
                            action: action.clone(),
                        })?;
                let parts = splitter(payload, n)?;
                if parts.len() == n {
                    Ok(parts)
                } else {
                    Err(FanoutError::WrongSplitArity {
                        got: parts.len(),
                        expected: n,
                    })
                }
            }
        }
    }

    /// Folds the ordered sub-result sequence into the parent result
    ///
    /// `first_success` never reaches this; the hub short-circuits it when the
    /// first child completes.
    ///
    /// # Errors
    /// Returns `FanoutError` when results do not fit the aggregator or a
    /// custom reducer fails.
    pub fn aggregate(
        &self,
        aggregator: AggregatorKind,
        action: &ActionName,
        results: Vec<Value>,
    ) -> Result<Value, FanoutError> {
        match aggregator {
            AggregatorKind::Concat => concat(results),
            AggregatorKind::Merge => merge(results),
            AggregatorKind::FirstSuccess => Ok(results.into_iter().next().unwrap_or(Value::Null)),
            AggregatorKind::Custom => {
                let reducer = self
                    .reducers
                    .get(action)
                    .ok_or_else(|| FanoutError::NoReducer {
                        action: action.clone(),
                    })?;
                reducer(results)
            }
        }
    }
}

/// Items distributed across buckets by index modulo n
fn round_robin(payload: &Value, n: usize) -> Result<Vec<Value>, FanoutError> {
    let items = payload
        .as_array()
        .ok_or(FanoutError::PayloadNotAList {
            strategy: SplitStrategy::RoundRobin,
        })?;
    let mut buckets = vec![Vec::new(); n];
    for (index, item) in items.iter().enumerate() {
        buckets[index % n].push(item.clone());
    }
    Ok(buckets.into_iter().map(Value::Array).collect())
}

/// Weight hint of one list item; objects may carry a `weight` field
fn item_weight(item: &Value) -> f64 {
    item.get("weight").and_then(Value::as_f64).unwrap_or(1.0)
}

/// Greedy min-max assignment: heaviest items first, each to the lightest
/// bucket, ties broken by bucket index
fn load_balanced(payload: &Value, n: usize) -> Result<Vec<Value>, FanoutError> {
    let items = payload
        .as_array()
        .ok_or(FanoutError::PayloadNotAList {
            strategy: SplitStrategy::LoadBalanced,
        })?;

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        item_weight(&items[b])
            .partial_cmp(&item_weight(&items[a]))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); n];
    let mut loads = vec![0.0_f64; n];
    for index in order {
        // strict less-than keeps the lowest bucket index on ties
        let mut lightest = 0;
        for bucket in 1..n {
            if loads[bucket] < loads[lightest] {
                lightest = bucket;
            }
        }
        loads[lightest] += item_weight(&items[index]);
        buckets[lightest].push(items[index].clone());
    }
    Ok(buckets.into_iter().map(Value::Array).collect())
}

/// List-valued results concatenated in sub-task index order
fn concat(results: Vec<Value>) -> Result<Value, FanoutError> {
    let mut combined = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Value::Array(items) => combined.extend(items),
            _ => return Err(FanoutError::ConcatNonList { index }),
        }
    }
    Ok(Value::Array(combined))
}

/// Mapping-valued results deep-merged; key conflicts resolved by the
/// later sub-task index
fn merge(results: Vec<Value>) -> Result<Value, FanoutError> {
    let mut combined = serde_json::Map::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Value::Object(map) => deep_merge(&mut combined, map),
            _ => return Err(FanoutError::MergeNonMapping { index }),
        }
    }
    Ok(Value::Object(combined))
}

fn deep_merge(into: &mut serde_json::Map<String, Value>, from: serde_json::Map<String, Value>) {
    for (key, value) in from {
        match into.entry(key) {
            serde_json::map::Entry::Occupied(mut slot) => match (slot.get_mut(), value) {
                (Value::Object(existing), Value::Object(incoming)) => {
                    deep_merge(existing, incoming);
                }
                (slot_value, value) => *slot_value = value,
            },
            serde_json::map::Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn action(name: &str) -> ActionName {
        ActionName::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn round_robin_distributes_by_index_modulo() {
        let registry = FanoutRegistry::new();
        let parts = registry
            .split(
                SplitStrategy::RoundRobin,
                &action("search"),
                &json!(["x", "y", "z", "w", "u"]),
                3,
            )
            .unwrap();
        assert_eq!(parts[0], json!(["x", "w"]));
        assert_eq!(parts[1], json!(["y", "u"]));
        assert_eq!(parts[2], json!(["z"]));
    }

    #[test]
    fn round_robin_rejects_non_list() {
        let registry = FanoutRegistry::new();
        let result = registry.split(
            SplitStrategy::RoundRobin,
            &action("search"),
            &json!({"not": "a list"}),
            2,
        );
        assert!(matches!(result, Err(FanoutError::PayloadNotAList { .. })));
    }

    #[test]
    fn broadcast_copies_full_payload() {
        let registry = FanoutRegistry::new();
        let payload = json!({"question": "same for everyone"});
        let parts = registry
            .split(SplitStrategy::Broadcast, &action("poll"), &payload, 3)
            .unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| *p == payload));
    }

    #[test]
    fn load_balanced_minimizes_max_weight() {
        let registry = FanoutRegistry::new();
        let payload = json!([
            {"id": "heavy", "weight": 10},
            {"id": "mid", "weight": 5},
            {"id": "light-1", "weight": 1},
            {"id": "light-2", "weight": 1},
            {"id": "light-3", "weight": 1},
        ]);
        let parts = registry
            .split(SplitStrategy::LoadBalanced, &action("crawl"), &payload, 2)
            .unwrap();

        let bucket_weight = |bucket: &Value| -> f64 {
            bucket
                .as_array()
                .unwrap()
                .iter()
                .map(item_weight)
                .sum()
        };
        let max = parts.iter().map(bucket_weight).fold(0.0, f64::max);
        // optimum is 10 vs 8; greedy must reach it here
        assert_eq!(max, 10.0);
    }

    #[test]
    fn custom_splitter_is_looked_up_by_action() {
        let registry = FanoutRegistry::new();
        registry.register_splitter(
            action("chunk"),
            Arc::new(|payload, n| {
                let text = payload.as_str().unwrap_or_default();
                Ok((0..n).map(|i| json!(format!("{text}:{i}"))).collect())
            }),
        );
        let parts = registry
            .split(SplitStrategy::Custom, &action("chunk"), &json!("doc"), 2)
            .unwrap();
        assert_eq!(parts, vec![json!("doc:0"), json!("doc:1")]);

        let missing = registry.split(SplitStrategy::Custom, &action("other"), &json!("doc"), 2);
        assert!(matches!(missing, Err(FanoutError::NoSplitter { .. })));
    }

    #[test]
    fn concat_preserves_sub_task_order() {
        let registry = FanoutRegistry::new();
        let combined = registry
            .aggregate(
                AggregatorKind::Concat,
                &action("search"),
                vec![json!(["a", "b"]), json!(["c"]), json!(["d", "e"])],
            )
            .unwrap();
        assert_eq!(combined, json!(["a", "b", "c", "d", "e"]));
    }

    #[test]
    fn merge_is_last_writer_by_index() {
        let registry = FanoutRegistry::new();
        let combined = registry
            .aggregate(
                AggregatorKind::Merge,
                &action("profile"),
                vec![
                    json!({"a": 1, "nested": {"x": 1, "y": 1}}),
                    json!({"b": 2, "nested": {"y": 2}}),
                ],
            )
            .unwrap();
        assert_eq!(combined, json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 2}}));
    }

    #[test]
    fn custom_reducer_runs() {
        let registry = FanoutRegistry::new();
        registry.register_reducer(
            action("vote"),
            Arc::new(|results| Ok(json!({ "votes": results.len() }))),
        );
        let combined = registry
            .aggregate(
                AggregatorKind::Custom,
                &action("vote"),
                vec![json!(1), json!(2)],
            )
            .unwrap();
        assert_eq!(combined, json!({"votes": 2}));
    }

    proptest! {
        /// Splitting never loses or reorders items within a bucket, and
        /// always yields exactly n buckets.
        #[test]
        fn round_robin_partition_laws(items in proptest::collection::vec(0u32..1000, 0..50), n in 1usize..8) {
            let payload = json!(items);
            let parts = round_robin(&payload, n).unwrap();
            prop_assert_eq!(parts.len(), n);

            let mut total = 0;
            for part in &parts {
                total += part.as_array().unwrap().len();
            }
            prop_assert_eq!(total, items.len());

            // bucket k holds exactly the items at indices == k (mod n), in order
            for (k, part) in parts.iter().enumerate() {
                let expected: Vec<u32> = items
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| i % n == k)
                    .map(|(_, v)| *v)
                    .collect();
                prop_assert_eq!(part, &json!(expected));
            }
        }

        /// Load-balanced splitting is a permutation-preserving partition.
        #[test]
        fn load_balanced_partition_laws(weights in proptest::collection::vec(1u32..20, 0..30), n in 1usize..6) {
            let items: Vec<Value> = weights.iter().map(|w| json!({"weight": w})).collect();
            let payload = Value::Array(items);
            let parts = load_balanced(&payload, n).unwrap();
            prop_assert_eq!(parts.len(), n);

            let total: usize = parts.iter().map(|p| p.as_array().unwrap().len()).sum();
            prop_assert_eq!(total, weights.len());
        }
    }
}
