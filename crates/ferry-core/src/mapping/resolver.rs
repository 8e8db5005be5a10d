//! Pure translation of source field values into target equivalents.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::UnmappedValue;
use crate::mapping::table::{DefaultPolicy, FieldCategory, MappingTable};
use crate::models::{SourceEntity, TargetPayload};

/// Keys that identify a value inside an object-shaped field, in lookup
/// order. User rules are keyed by email, so a user object carrying both a
/// login and an email resolves on the email.
fn identity_keys(category: FieldCategory) -> &'static [&'static str] {
    match category {
        FieldCategory::User => &["emailAddress", "name"],
        _ => &["name", "value"],
    }
}

/// A source value replaced by its category's fallback because no rule
/// matched it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSubstitution {
    pub category: FieldCategory,
    pub field: String,
    pub source_value: String,
    pub target_value: String,
}

/// A translated payload plus the fallback substitutions that went into it.
#[derive(Clone, Debug, PartialEq)]
pub struct Translation {
    pub payload: TargetPayload,
    pub substitutions: Vec<FallbackSubstitution>,
}

/// Stateless resolver over an immutable [`MappingTable`]. Identical inputs
/// always produce identical outputs, which lets the validator recompute what
/// the engine wrote.
#[derive(Clone, Debug)]
pub struct MappingResolver {
    table: MappingTable,
}

impl MappingResolver {
    pub fn new(table: MappingTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    pub fn resolve(&self, category: FieldCategory, value: &str) -> Result<String, UnmappedValue> {
        self.resolve_field(category.as_str(), category, value, &mut Vec::new())
    }

    fn resolve_field(
        &self,
        field: &str,
        category: FieldCategory,
        value: &str,
        substitutions: &mut Vec<FallbackSubstitution>,
    ) -> Result<String, UnmappedValue> {
        let Some(rules) = self.table.category(category) else {
            return Ok(value.to_string());
        };
        if let Some(target) = rules.rules.get(value) {
            return Ok(target.clone());
        }
        match &rules.default {
            DefaultPolicy::Literal => Ok(value.to_string()),
            DefaultPolicy::Fallback { value: fallback } => {
                // Empty source values carry nothing worth reporting.
                if !value.is_empty() {
                    substitutions.push(FallbackSubstitution {
                        category,
                        field: field.to_string(),
                        source_value: value.to_string(),
                        target_value: fallback.clone(),
                    });
                }
                Ok(fallback.clone())
            }
            DefaultPolicy::Fail => Err(UnmappedValue {
                category,
                field: field.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Map one field value. Strings, identity objects, and arrays of either
    /// are translated; anything else passes through.
    pub fn map_value(
        &self,
        field: &str,
        category: FieldCategory,
        value: &Value,
    ) -> Result<Value, UnmappedValue> {
        self.map_value_traced(field, category, value, &mut Vec::new())
    }

    fn map_value_traced(
        &self,
        field: &str,
        category: FieldCategory,
        value: &Value,
        substitutions: &mut Vec<FallbackSubstitution>,
    ) -> Result<Value, UnmappedValue> {
        match value {
            Value::String(s) => self
                .resolve_field(field, category, s, substitutions)
                .map(Value::String),
            Value::Array(items) => items
                .iter()
                .map(|item| self.map_value_traced(field, category, item, substitutions))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut mapped = obj.clone();
                for key in identity_keys(category) {
                    if let Some(Value::String(s)) = obj.get(*key) {
                        let target = self.resolve_field(field, category, s, substitutions)?;
                        mapped.insert((*key).to_string(), Value::String(target));
                        break;
                    }
                }
                Ok(Value::Object(mapped))
            }
            other => Ok(other.clone()),
        }
    }

    /// Build the target payload for `entity`, collecting every unmapped value
    /// rather than stopping at the first.
    pub fn translate(&self, entity: &SourceEntity) -> Result<TargetPayload, Vec<UnmappedValue>> {
        self.translate_traced(entity).map(|t| t.payload)
    }

    /// [`Self::translate`], also reporting each fallback substitution.
    pub fn translate_traced(&self, entity: &SourceEntity) -> Result<Translation, Vec<UnmappedValue>> {
        let mut fields: IndexMap<String, Value> = IndexMap::with_capacity(entity.fields.len());
        let mut unmapped = Vec::new();
        let mut substitutions = Vec::new();

        for (name, value) in &entity.fields {
            let target_name = self.table.target_field(name).to_string();
            match self.table.binding(name) {
                Some(category) => match self.map_value_traced(name, category, value, &mut substitutions) {
                    Ok(mapped) => {
                        fields.insert(target_name, mapped);
                    }
                    Err(err) => unmapped.push(err),
                },
                None => {
                    fields.insert(target_name, value.clone());
                }
            }
        }

        for (name, default) in self.table.field_defaults() {
            let missing = match fields.get(name) {
                None | Some(Value::Null) => true,
                Some(Value::Array(items)) => items.is_empty(),
                Some(_) => false,
            };
            if missing {
                fields.insert(name.clone(), default.clone());
            }
        }

        for (name, extra) in self.table.field_appends() {
            let slot = fields.entry(name.clone()).or_insert(Value::Null);
            let mut items = match std::mem::take(slot) {
                Value::Null => Vec::new(),
                Value::Array(items) => items,
                single => vec![single],
            };
            for value in extra {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
            *slot = Value::Array(items);
        }

        if !unmapped.is_empty() {
            return Err(unmapped);
        }
        Ok(Translation {
            payload: TargetPayload {
                kind: entity.kind,
                fields,
                payload_ref: entity.payload_ref.clone(),
            },
            substitutions,
        })
    }

    /// Whether `target_field` carries a value produced by mapping rules or
    /// configured defaults, as opposed to copied content.
    pub fn is_mapped_target_field(&self, target_field: &str) -> bool {
        if self.table.field_defaults().contains_key(target_field)
            || self.table.field_appends().contains_key(target_field)
        {
            return true;
        }
        self.table
            .bindings()
            .keys()
            .any(|source| self.table.target_field(source) == target_field)
    }
}
