use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payload of a `weights` document. Plain last-writer-wins data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightEntry {
    pub date: NaiveDate,
    pub kilograms: f64,
    #[serde(default)]
    pub note: Option<String>,
}

impl WeightEntry {
    pub fn new(date: NaiveDate, kilograms: f64) -> Self {
        Self {
            date,
            kilograms,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for WeightEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:.1} kg", self.date, self.kilograms)?;
        if let Some(note) = &self.note {
            write!(f, " ({})", note)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_display() {
        let entry = WeightEntry::new(NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(), 81.4)
            .with_note("after run");
        assert_eq!(entry.to_string(), "2025-03-02: 81.4 kg (after run)");
    }
}
