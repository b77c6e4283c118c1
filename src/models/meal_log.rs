//! The composite `meal_logs` document.
//!
//! A meal log embeds an ordered list of food items. Each item carries its own
//! `updated_at`/`deleted_at`, which is what lets two diverged copies of the
//! same log be merged item by item. Deleted items stay in the list as
//! tombstones; [`Totals`] only counts live ones.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MealType::Breakfast => "breakfast",
            MealType::Lunch => "lunch",
            MealType::Dinner => "dinner",
            MealType::Snack => "snack",
        }
    }
}

impl fmt::Display for MealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            MealType::Breakfast,
            MealType::Lunch,
            MealType::Dinner,
            MealType::Snack,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| {
            format!(
                "Invalid meal type '{}'. Valid options: breakfast, lunch, dinner, snack",
                s
            )
        })
    }
}

/// One eaten food inside a meal log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodItem {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
    pub calories: f64,
    #[serde(default)]
    pub protein_g: f64,
    #[serde(default)]
    pub carbs_g: f64,
    #[serde(default)]
    pub fat_g: f64,
}

impl FoodItem {
    pub fn new(name: impl Into<String>, calories: f64, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            updated_at: at,
            deleted_at: None,
            name: name.into(),
            calories,
            protein_g: 0.0,
            carbs_g: 0.0,
            fat_g: 0.0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_macros(mut self, protein_g: f64, carbs_g: f64, fat_g: f64) -> Self {
        self.protein_g = protein_g;
        self.carbs_g = carbs_g;
        self.fat_g = fat_g;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Nutrition aggregate over the live items of a meal log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub calories: f64,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
    pub item_count: usize,
}

impl Totals {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a FoodItem>) -> Self {
        items
            .into_iter()
            .filter(|item| !item.is_deleted())
            .fold(Totals::default(), |mut acc, item| {
                acc.calories += item.calories;
                acc.protein_g += item.protein_g;
                acc.carbs_g += item.carbs_g;
                acc.fat_g += item.fat_g;
                acc.item_count += 1;
                acc
            })
    }
}

/// Payload of a `meal_logs` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealLog {
    pub date: NaiveDate,
    pub meal_type: MealType,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub items: Vec<FoodItem>,
    #[serde(default)]
    pub totals: Totals,
}

impl MealLog {
    pub fn new(date: NaiveDate, meal_type: MealType) -> Self {
        Self {
            date,
            meal_type,
            notes: None,
            items: Vec::new(),
            totals: Totals::default(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_items(mut self, items: Vec<FoodItem>) -> Self {
        self.set_items(items);
        self
    }

    /// Replaces the item list and recomputes totals.
    pub fn set_items(&mut self, items: Vec<FoodItem>) {
        self.items = items;
        self.recompute_totals();
    }

    pub fn add_item(&mut self, item: FoodItem) {
        self.items.push(item);
        self.recompute_totals();
    }

    /// Applies `edit` to a live item and stamps it. Returns false if no live
    /// item has that id.
    pub fn edit_item(
        &mut self,
        item_id: &str,
        at: DateTime<Utc>,
        edit: impl FnOnce(&mut FoodItem),
    ) -> bool {
        let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.id == item_id && !i.is_deleted())
        else {
            return false;
        };
        edit(item);
        item.updated_at = at;
        self.recompute_totals();
        true
    }

    /// Tombstones a live item. Returns false if no live item has that id.
    pub fn remove_item(&mut self, item_id: &str, at: DateTime<Utc>) -> bool {
        let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.id == item_id && !i.is_deleted())
        else {
            return false;
        };
        item.deleted_at = Some(at);
        item.updated_at = at;
        self.recompute_totals();
        true
    }

    pub fn live_items(&self) -> impl Iterator<Item = &FoodItem> {
        self.items.iter().filter(|i| !i.is_deleted())
    }

    pub fn recompute_totals(&mut self) {
        self.totals = Totals::from_items(&self.items);
    }

    /// Parses a document payload. Totals are always recomputed, never
    /// taken from the wire.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut log: MealLog = serde_json::from_value(payload.clone())?;
        log.recompute_totals();
        Ok(log)
    }

    pub fn to_payload(&self) -> serde_json::Value {
        // A struct of plain fields always serializes.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for MealLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Meal Log: {} - {}", self.date, self.meal_type)?;
        writeln!(f, "{}", "=".repeat(30))?;

        for item in self.live_items() {
            writeln!(f, "  - {} ({:.0} kcal) [{}]", item.name, item.calories, item.id)?;
        }

        writeln!(
            f,
            "Total: {:.0} kcal, {:.1}g protein, {:.1}g carbs, {:.1}g fat ({} items)",
            self.totals.calories,
            self.totals.protein_g,
            self.totals.carbs_g,
            self.totals.fat_g,
            self.totals.item_count
        )?;

        if let Some(notes) = &self.notes {
            writeln!(f, "\nNotes: {}", notes)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::epoch_plus_secs;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    #[test]
    fn test_meal_type_parse_is_case_insensitive() {
        assert_eq!("LUNCH".parse::<MealType>().unwrap(), MealType::Lunch);
        assert_eq!("snack".parse::<MealType>().unwrap(), MealType::Snack);
        assert!("brunch".parse::<MealType>().is_err());
    }

    #[test]
    fn test_totals_follow_item_changes() {
        let mut log = MealLog::new(date(), MealType::Lunch);
        let rice = FoodItem::new("rice", 200.0, epoch_plus_secs(1))
            .with_id("rice")
            .with_macros(4.0, 45.0, 0.5);
        let egg = FoodItem::new("egg", 70.0, epoch_plus_secs(1)).with_id("egg");

        log.add_item(rice);
        log.add_item(egg);
        assert_eq!(log.totals.calories, 270.0);
        assert_eq!(log.totals.item_count, 2);

        assert!(log.edit_item("egg", epoch_plus_secs(2), |i| i.calories = 90.0));
        assert_eq!(log.totals.calories, 290.0);

        assert!(log.remove_item("rice", epoch_plus_secs(3)));
        assert_eq!(log.totals.calories, 90.0);
        assert_eq!(log.totals.item_count, 1);
        assert_eq!(log.totals.carbs_g, 0.0);

        // The tombstone is retained.
        assert_eq!(log.items.len(), 2);
        assert_eq!(log.live_items().count(), 1);
    }

    #[test]
    fn test_removed_item_cannot_be_edited() {
        let mut log = MealLog::new(date(), MealType::Dinner)
            .with_items(vec![FoodItem::new("soup", 120.0, epoch_plus_secs(1)).with_id("soup")]);

        assert!(log.remove_item("soup", epoch_plus_secs(2)));
        assert!(!log.remove_item("soup", epoch_plus_secs(3)));
        assert!(!log.edit_item("soup", epoch_plus_secs(3), |i| i.calories = 1.0));
        assert!(!log.edit_item("missing", epoch_plus_secs(3), |_| {}));
    }

    #[test]
    fn test_payload_totals_are_recomputed() {
        let payload = json!({
            "date": "2025-01-01",
            "mealType": "breakfast",
            "items": [
                {"id": "a", "updatedAt": "1970-01-01T00:00:10Z", "name": "toast", "calories": 100.0},
                {"id": "b", "updatedAt": "1970-01-01T00:00:11Z", "deletedAt": "1970-01-01T00:00:11Z",
                 "name": "jam", "calories": 50.0}
            ],
            "totals": {"calories": 9999.0, "proteinG": 0.0, "carbsG": 0.0, "fatG": 0.0, "itemCount": 7}
        });

        let log = MealLog::from_payload(&payload).unwrap();
        assert_eq!(log.totals.calories, 100.0);
        assert_eq!(log.totals.item_count, 1);
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        assert!(MealLog::from_payload(&json!({"date": "not a date"})).is_err());
        assert!(MealLog::from_payload(&json!("garbage")).is_err());
    }

    #[test]
    fn test_display_lists_live_items_only() {
        let mut log = MealLog::new(date(), MealType::Dinner).with_notes("Delicious!");
        log.add_item(FoodItem::new("pasta", 450.0, epoch_plus_secs(1)).with_id("p"));
        log.add_item(FoodItem::new("salad", 80.0, epoch_plus_secs(1)).with_id("s"));
        log.remove_item("s", epoch_plus_secs(2));

        let output = format!("{}", log);
        assert!(output.contains("2025-01-01"));
        assert!(output.contains("dinner"));
        assert!(output.contains("pasta"));
        assert!(!output.contains("salad"));
        assert!(output.contains("Delicious!"));
    }
}
