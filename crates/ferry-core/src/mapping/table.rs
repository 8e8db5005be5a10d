//! Declarative mapping table: per-category value rules, default policies,
//! field bindings, custom-field renames, and field defaults.
//!
//! The JSON layout is:
//!
//! ```json
//! {
//!   "categories": {
//!     "status": {
//!       "rules": [{"source": "In Progress", "target": "Doing"}],
//!       "default": {"policy": "fail"}
//!     },
//!     "user": {
//!       "rules": [{"source": "a@old.io", "target": "a@new.io"}],
//!       "default": {"policy": "fallback", "value": "admin@example.com"}
//!     }
//!   },
//!   "bindings": {"qa_owner": "user"},
//!   "renames": {"customfield_10010": "customfield_20010"},
//!   "defaults": {"components": [{"name": "General"}]},
//!   "append": {"labels": ["migrated"]}
//! }
//! ```
//!
//! `defaults` fill a field only when the source leaves it absent or empty;
//! `append` values are added to whatever array the source carries.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FerryError, FerryResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    User,
    Status,
    IssueType,
    Priority,
    Component,
    Version,
    Custom,
}

impl FieldCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldCategory::User => "user",
            FieldCategory::Status => "status",
            FieldCategory::IssueType => "issue_type",
            FieldCategory::Priority => "priority",
            FieldCategory::Component => "component",
            FieldCategory::Version => "version",
            FieldCategory::Custom => "custom",
        }
    }
}

/// What to do when a source value has no rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DefaultPolicy {
    /// Pass the source value through unchanged.
    #[default]
    Literal,
    /// Substitute a configured constant.
    Fallback { value: String },
    /// Reject the entity with an unmapped-value error.
    Fail,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub source: String,
    pub target: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct CategorySpec {
    rules: Vec<MappingRule>,
    default: DefaultPolicy,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct TableSpec {
    categories: BTreeMap<FieldCategory, CategorySpec>,
    bindings: IndexMap<String, FieldCategory>,
    renames: IndexMap<String, String>,
    defaults: IndexMap<String, Value>,
    append: IndexMap<String, Vec<Value>>,
}

/// Rules for one category.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CategoryRules {
    pub rules: IndexMap<String, String>,
    pub default: DefaultPolicy,
}

/// Immutable mapping table loaded once per run.
#[derive(Clone, Debug, PartialEq)]
pub struct MappingTable {
    categories: BTreeMap<FieldCategory, CategoryRules>,
    bindings: IndexMap<String, FieldCategory>,
    renames: IndexMap<String, String>,
    defaults: IndexMap<String, Value>,
    appends: IndexMap<String, Vec<Value>>,
}

/// Source fields bound to a category when the table does not say otherwise.
pub const DEFAULT_BINDINGS: &[(&str, FieldCategory)] = &[
    ("reporter", FieldCategory::User),
    ("assignee", FieldCategory::User),
    ("author", FieldCategory::User),
    ("status", FieldCategory::Status),
    ("issuetype", FieldCategory::IssueType),
    ("priority", FieldCategory::Priority),
    ("components", FieldCategory::Component),
    ("fixVersions", FieldCategory::Version),
];

impl Default for MappingTable {
    fn default() -> Self {
        Self {
            categories: BTreeMap::new(),
            bindings: default_bindings(),
            renames: IndexMap::new(),
            defaults: IndexMap::new(),
            appends: IndexMap::new(),
        }
    }
}

fn default_bindings() -> IndexMap<String, FieldCategory> {
    DEFAULT_BINDINGS
        .iter()
        .map(|(field, category)| (field.to_string(), *category))
        .collect()
}

impl MappingTable {
    pub fn from_json_str(raw: &str) -> FerryResult<Self> {
        let spec: TableSpec = serde_json::from_str(raw)?;
        let mut table = MappingTable::default();
        for (category, cat_spec) in spec.categories {
            table.set_policy(category, cat_spec.default);
            for rule in cat_spec.rules {
                table.add_rule(category, rule.source, rule.target)?;
            }
        }
        for (field, category) in spec.bindings {
            table.bind(field, category);
        }
        for (source_field, target_field) in spec.renames {
            table.rename(source_field, target_field);
        }
        for (field, value) in spec.defaults {
            table.set_default_value(field, value);
        }
        for (field, values) in spec.append {
            table.append_values(field, values);
        }
        Ok(table)
    }

    pub fn from_path(path: &Path) -> FerryResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FerryError::Config(format!("cannot read mapping table {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Add a rule. A source value may appear only once per category.
    pub fn add_rule(
        &mut self,
        category: FieldCategory,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> FerryResult<()> {
        let source = source.into();
        let rules = &mut self.categories.entry(category).or_default().rules;
        if rules.contains_key(&source) {
            return Err(FerryError::Config(format!(
                "duplicate {} rule for source value {:?}",
                category.as_str(),
                source
            )));
        }
        rules.insert(source, target.into());
        Ok(())
    }

    pub fn set_policy(&mut self, category: FieldCategory, policy: DefaultPolicy) {
        self.categories.entry(category).or_default().default = policy;
    }

    pub fn bind(&mut self, field: impl Into<String>, category: FieldCategory) {
        self.bindings.insert(field.into(), category);
    }

    pub fn rename(&mut self, source_field: impl Into<String>, target_field: impl Into<String>) {
        self.renames.insert(source_field.into(), target_field.into());
    }

    pub fn set_default_value(&mut self, field: impl Into<String>, value: Value) {
        self.defaults.insert(field.into(), value);
    }

    /// Values added to the array in `field` of every translated entity.
    pub fn append_values(&mut self, field: impl Into<String>, values: Vec<Value>) {
        self.appends.entry(field.into()).or_default().extend(values);
    }

    pub fn category(&self, category: FieldCategory) -> Option<&CategoryRules> {
        self.categories.get(&category)
    }

    pub fn binding(&self, field: &str) -> Option<FieldCategory> {
        self.bindings.get(field).copied()
    }

    pub fn bindings(&self) -> &IndexMap<String, FieldCategory> {
        &self.bindings
    }

    pub fn target_field<'a>(&'a self, source_field: &'a str) -> &'a str {
        self.renames
            .get(source_field)
            .map(String::as_str)
            .unwrap_or(source_field)
    }

    pub fn field_defaults(&self) -> &IndexMap<String, Value> {
        &self.defaults
    }

    pub fn field_appends(&self) -> &IndexMap<String, Vec<Value>> {
        &self.appends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{
        "categories": {
            "status": {
                "rules": [{"source": "In Progress", "target": "Doing"}],
                "default": {"policy": "fail"}
            },
            "user": {
                "rules": [{"source": "a@old.io", "target": "a@new.io"}],
                "default": {"policy": "fallback", "value": "admin@example.com"}
            }
        },
        "bindings": {"qa_owner": "user"},
        "renames": {"customfield_10010": "customfield_20010"},
        "defaults": {"components": [{"name": "General"}]},
        "append": {"labels": ["migrated"]}
    }"#;

    #[test]
    fn loads_json_layout() {
        let table = MappingTable::from_json_str(SAMPLE).unwrap();
        let status = table.category(FieldCategory::Status).unwrap();
        assert_eq!(status.rules.get("In Progress").map(String::as_str), Some("Doing"));
        assert_eq!(status.default, DefaultPolicy::Fail);
        assert_eq!(
            table.category(FieldCategory::User).unwrap().default,
            DefaultPolicy::Fallback {
                value: "admin@example.com".into()
            }
        );
        assert_eq!(table.binding("qa_owner"), Some(FieldCategory::User));
        assert_eq!(table.binding("status"), Some(FieldCategory::Status));
        assert_eq!(table.target_field("customfield_10010"), "customfield_20010");
        assert_eq!(table.target_field("summary"), "summary");
        assert_eq!(
            table.field_defaults().get("components"),
            Some(&json!([{"name": "General"}]))
        );
        assert_eq!(table.field_appends().get("labels"), Some(&vec![json!("migrated")]));
    }

    #[test]
    fn duplicate_source_values_are_rejected() {
        let raw = r#"{"categories": {"priority": {"rules": [
            {"source": "P1", "target": "Highest"},
            {"source": "P1", "target": "High"}
        ]}}}"#;
        let err = MappingTable::from_json_str(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate priority rule"));
    }

    #[test]
    fn same_value_in_different_categories_is_allowed() {
        let mut table = MappingTable::default();
        table.add_rule(FieldCategory::Status, "Done", "Closed").unwrap();
        table.add_rule(FieldCategory::Custom, "Done", "done").unwrap();
        assert!(table.add_rule(FieldCategory::Status, "Done", "Resolved").is_err());
    }
}
