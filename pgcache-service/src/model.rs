//! Relational model graph and the dependent-table walk.
//!
//! A cacheable method can declare a root model instead of a table list. The
//! tables its result depends on are found by walking the root's relations,
//! optionally narrowed by a nested selection map such as one built from a
//! GraphQL request:
//!
//! ```json
//! { "id": true, "items": { "product": { "name": true } } }
//! ```
//!
//! Keys that name relations are followed; other keys are ignored. A relation
//! selected by a leaf such as `true` contributes its own tables but none of
//! its relations. A missing, `null` or `false` selection follows everything.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Turns a root model into the tables a result read from it depends on.
pub trait DependentTables: Send + Sync {
    /// Ordered, duplicate-free table names, root first. `selected_fields`
    /// narrows which relations are followed; `None` follows all of them.
    fn dependent_tables(&self, root: &str, selected_fields: Option<&Value>) -> Vec<String>;
}

/// A relation from one model to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Field name the relation is selected by.
    pub name: String,
    /// Target model name.
    pub target: String,
    /// Join model for many-to-many relations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub through: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl Model {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            relations: Vec::new(),
        }
    }

    pub fn relation(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relations.push(Relation {
            name: name.into(),
            target: target.into(),
            through: None,
        });
        self
    }

    pub fn relation_through(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        through: impl Into<String>,
    ) -> Self {
        self.relations.push(Relation {
            name: name.into(),
            target: target.into(),
            through: Some(through.into()),
        });
        self
    }

    fn find_relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Registry of models keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelGraph {
    models: HashMap<String, Model>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: Model) -> Self {
        self.insert(model);
        self
    }

    pub fn insert(&mut self, model: Model) {
        self.models.insert(model.name.clone(), model);
    }

    pub fn get(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    fn walk(&self, model: &Model, fields: Option<&Value>, tables: &mut Vec<String>) {
        tables.push(model.table.clone());

        let selected: Vec<(&Relation, Option<&Value>)> = match fields {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(field, sub)| model.find_relation(field).map(|r| (r, Some(sub))))
                .collect(),
            Some(leaf) if is_selected(leaf) => Vec::new(),
            _ => model.relations.iter().map(|r| (r, None)).collect(),
        };

        for (relation, sub_fields) in selected {
            let through = relation.through.as_deref().and_then(|name| self.get(name));
            for next in through.into_iter().chain(self.get(&relation.target)) {
                if !tables.contains(&next.table) {
                    self.walk(next, sub_fields, tables);
                }
            }
        }
    }
}

/// Whether a leaf selection value counts as "selected".
fn is_selected(leaf: &Value) -> bool {
    match leaf {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl DependentTables for ModelGraph {
    fn dependent_tables(&self, root: &str, selected_fields: Option<&Value>) -> Vec<String> {
        let mut tables = Vec::new();
        match self.get(root) {
            Some(model) => self.walk(model, selected_fields, &mut tables),
            None => tracing::warn!(model = root, "unknown model, no dependent tables"),
        }
        tables
    }
}
