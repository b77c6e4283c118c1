mod change;
mod document;
mod meal_log;
mod weight;

pub use change::{ChangeRecord, Operation};
pub use document::{LocalDocument, SyncableDocument};
pub use meal_log::{FoodItem, MealLog, MealType, Totals};
pub use weight::WeightEntry;

/// Collection holding composite meal logs (merged item by item).
pub const MEAL_LOGS: &str = "meal_logs";
/// Collection holding body-weight entries (last writer wins).
pub const WEIGHTS: &str = "weights";
