//! Change computation between two namespace snapshots

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Configurations;

/// Kind of a single key change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Add => "add",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// One key difference between two snapshots.
///
/// `value` carries the new value for `Add`/`Update` and the old value for
/// `Delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub key: String,
    pub value: Value,
}

impl Change {
    pub fn new(change_type: ChangeType, key: impl Into<String>, value: Value) -> Self {
        Self {
            change_type,
            key: key.into(),
            value,
        }
    }
}

/// Compute the change set turning `old` into `new`.
///
/// Values compare structurally; a key mapped to null and an absent key are
/// different things. The result is sorted ascending by key.
pub fn diff(old: &Configurations, new: &Configurations) -> Vec<Change> {
    let mut changes = Vec::new();

    for (key, new_value) in new {
        match old.get(key) {
            Some(old_value) => {
                if old_value != new_value {
                    changes.push(Change::new(ChangeType::Update, key, new_value.clone()));
                }
            }
            None => changes.push(Change::new(ChangeType::Add, key, new_value.clone())),
        }
    }

    for (key, old_value) in old {
        if !new.contains_key(key) {
            changes.push(Change::new(ChangeType::Delete, key, old_value.clone()));
        }
    }

    changes.sort_by(|a, b| a.key.cmp(&b.key));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configs(pairs: &[(&str, Value)]) -> Configurations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_diff_add_update_delete() {
        let old = configs(&[("a", json!("1")), ("b", json!("2")), ("c", json!("3"))]);
        let new = configs(&[("a", json!("1")), ("b", json!("20")), ("d", json!("4"))]);

        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![
                Change::new(ChangeType::Update, "b", json!("20")),
                Change::new(ChangeType::Delete, "c", json!("3")),
                Change::new(ChangeType::Add, "d", json!("4")),
            ]
        );
    }

    #[test]
    fn test_diff_identity_is_empty() {
        let snapshot = configs(&[("a", json!("1")), ("b", json!({"x": [1, 2]}))]);
        assert!(diff(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn test_diff_applying_changes_reconstructs_new() {
        let old = configs(&[("a", json!(1)), ("b", json!(true)), ("c", json!("x"))]);
        let new = configs(&[("b", json!(false)), ("c", json!("x")), ("e", json!(null))]);

        let mut rebuilt = old.clone();
        for change in diff(&old, &new) {
            match change.change_type {
                ChangeType::Add | ChangeType::Update => {
                    rebuilt.insert(change.key, change.value);
                }
                ChangeType::Delete => {
                    rebuilt.remove(&change.key);
                }
            }
        }
        assert_eq!(rebuilt, new);
    }

    #[test]
    fn test_diff_null_vs_missing() {
        let old = Configurations::new();
        let new = configs(&[("a", json!(null))]);

        let changes = diff(&old, &new);
        assert_eq!(changes, vec![Change::new(ChangeType::Add, "a", json!(null))]);

        // The other direction is a delete carrying the old (null) value.
        let back = diff(&new, &old);
        assert_eq!(back, vec![Change::new(ChangeType::Delete, "a", json!(null))]);
    }

    #[test]
    fn test_diff_sorted_without_duplicates() {
        let old = configs(&[("z", json!("1")), ("m", json!("2"))]);
        let new = configs(&[("a", json!("3")), ("m", json!("4"))]);

        let changes = diff(&old, &new);
        let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "m", "z"]);
    }

    #[test]
    fn test_change_type_serialization() {
        assert_eq!(serde_json::to_string(&ChangeType::Add).unwrap(), "\"add\"");
        assert_eq!(ChangeType::Delete.as_str(), "delete");
    }
}
