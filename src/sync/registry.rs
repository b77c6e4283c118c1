//! Per-collection merge policy, shared by client and server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{MealLog, MEAL_LOGS, WEIGHTS};

/// Dishes are plain saved recipes; the collection has no typed model here.
pub const DISHES: &str = "dishes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// Whole-document last writer wins.
    Lww,
    /// Composite meal log, merged item by item.
    ItemMerge,
}

#[derive(Debug, Clone)]
pub struct CollectionRegistry {
    kinds: BTreeMap<String, MergeKind>,
}

impl Default for CollectionRegistry {
    fn default() -> Self {
        Self::empty()
            .register(MEAL_LOGS, MergeKind::ItemMerge)
            .register(WEIGHTS, MergeKind::Lww)
            .register(DISHES, MergeKind::Lww)
    }
}

impl CollectionRegistry {
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    pub fn register(mut self, collection: impl Into<String>, kind: MergeKind) -> Self {
        self.kinds.insert(collection.into(), kind);
        self
    }

    /// Unregistered collections are plain last-writer-wins.
    pub fn kind_of(&self, collection: &str) -> MergeKind {
        self.kinds
            .get(collection)
            .copied()
            .unwrap_or(MergeKind::Lww)
    }

    pub fn is_composite(&self, collection: &str) -> bool {
        self.kind_of(collection) == MergeKind::ItemMerge
    }

    /// Registered collection names, sorted.
    pub fn collections(&self) -> Vec<String> {
        self.kinds.keys().cloned().collect()
    }

    /// Checks a payload against its collection's shape and returns it in
    /// canonical form. Composite payloads get their totals recomputed.
    pub fn normalize(
        &self,
        collection: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        match self.kind_of(collection) {
            MergeKind::ItemMerge => MealLog::from_payload(payload)
                .map(|log| log.to_payload())
                .map_err(|e| format!("invalid {} payload: {}", collection, e)),
            MergeKind::Lww if payload.is_object() => Ok(payload.clone()),
            MergeKind::Lww => Err(format!("{} payload must be a JSON object", collection)),
        }
    }
}
