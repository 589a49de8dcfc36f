//! Saga templates and content lookup.

use std::collections::BTreeMap;
use std::path::Path;

use common::{SagaRef, TriggerRef};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// A content record addressed by a reference name.
///
/// Each record type names the field that identifies it, so an index can be
/// built without looking fields up by name at runtime.
pub trait ContentRecord {
    /// The reference type that identifies records of this kind.
    type Ref: Clone + Ord + std::fmt::Display;

    /// Returns the reference of this record.
    fn reference(&self) -> &Self::Ref;
}

/// Lookup table of content records keyed by their reference.
#[derive(Debug, Clone)]
pub struct ContentIndex<T: ContentRecord> {
    records: BTreeMap<T::Ref, T>,
}

impl<T: ContentRecord> Default for ContentIndex<T> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<T: ContentRecord> ContentIndex<T> {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index, failing if two records share a reference.
    pub fn from_records(records: impl IntoIterator<Item = T>) -> Result<Self> {
        let mut index = Self::new();
        for record in records {
            let reference = record.reference().clone();
            if index.insert(record).is_some() {
                return Err(EngineError::InvalidCatalog(format!(
                    "duplicate content reference {reference}"
                )));
            }
        }
        Ok(index)
    }

    /// Inserts a record, returning the one it replaced.
    pub fn insert(&mut self, record: T) -> Option<T> {
        self.records.insert(record.reference().clone(), record)
    }

    /// Looks up a record.
    pub fn get(&self, reference: &T::Ref) -> Option<&T> {
        self.records.get(reference)
    }

    /// Returns true if a record with this reference exists.
    pub fn contains(&self, reference: &T::Ref) -> bool {
        self.records.contains_key(reference)
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over records in reference order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.values()
    }
}

/// Static description of a saga: its reference and the triggers it declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaTemplate {
    pub saga_ref: SagaRef,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub triggers: Vec<TriggerRef>,
}

impl SagaTemplate {
    /// Creates a template declaring the given triggers.
    pub fn new(
        saga_ref: impl Into<SagaRef>,
        triggers: impl IntoIterator<Item = impl Into<TriggerRef>>,
    ) -> Self {
        Self {
            saga_ref: saga_ref.into(),
            display_name: None,
            triggers: triggers.into_iter().map(Into::into).collect(),
        }
    }

    /// Sets the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Returns true if the template declares the trigger.
    pub fn declares_trigger(&self, trigger_ref: &TriggerRef) -> bool {
        self.triggers.contains(trigger_ref)
    }
}

impl ContentRecord for SagaTemplate {
    type Ref = SagaRef;

    fn reference(&self) -> &SagaRef {
        &self.saga_ref
    }
}

/// All saga templates known to the engine.
pub type TemplateCatalog = ContentIndex<SagaTemplate>;

impl ContentIndex<SagaTemplate> {
    /// Parses a catalog from a JSON array of templates.
    pub fn from_json(json: &str) -> Result<Self> {
        let templates: Vec<SagaTemplate> = serde_json::from_str(json)?;
        Self::from_records(templates)
    }

    /// Reads a catalog from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Looks up the template of a saga, failing with `TemplateNotFound`.
    pub fn require(&self, saga_ref: &SagaRef) -> Result<&SagaTemplate> {
        self.get(saga_ref)
            .ok_or_else(|| EngineError::TemplateNotFound(saga_ref.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_from_json() {
        let catalog = TemplateCatalog::from_json(
            r#"[
                {"saga_ref": "sunken_crypt", "display_name": "The Sunken Crypt", "triggers": ["approach", "inner_sanctum"]},
                {"saga_ref": "old_mill"}
            ]"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        let crypt = catalog.require(&SagaRef::new("sunken_crypt")).unwrap();
        assert!(crypt.declares_trigger(&TriggerRef::new("approach")));
        assert!(!crypt.declares_trigger(&TriggerRef::new("gate")));
        assert!(catalog.get(&SagaRef::new("old_mill")).unwrap().triggers.is_empty());
    }

    #[test]
    fn duplicate_references_are_rejected() {
        let result = TemplateCatalog::from_records([
            SagaTemplate::new("crypt", ["a"]),
            SagaTemplate::new("crypt", ["b"]),
        ]);

        assert!(matches!(result, Err(EngineError::InvalidCatalog(_))));
    }

    #[test]
    fn missing_template_is_reported() {
        let catalog = TemplateCatalog::new();
        let result = catalog.require(&SagaRef::new("nowhere"));

        assert!(matches!(result, Err(EngineError::TemplateNotFound(r)) if r.as_str() == "nowhere"));
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let result = TemplateCatalog::from_json("{\"saga_ref\": 3}");
        assert!(matches!(result, Err(EngineError::Serialization(_))));
    }
}
