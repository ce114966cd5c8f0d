use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use smol_str::SmolStr;

use crate::field::{FieldResult, read_lock, write_lock};

#[derive(Clone, Debug, Default, PartialEq)]
struct FieldEntry {
    value: Value,
    valid: Option<bool>,
    message: Option<String>,
    error_key: Option<SmolStr>,
}

/// Shared aggregation of per-field state, keyed by field name. Exposes the
/// same read/write contract a controller uses locally, so a controller is
/// agnostic to whether it is standalone or attached to a store. Each
/// controller writes only its own key.
#[derive(Clone, Default)]
pub struct FormStore {
    entries: Arc<RwLock<BTreeMap<String, FieldEntry>>>,
}

impl FormStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent per name: re-registering keeps whatever value and validity
    /// the field already has.
    pub fn register(&self, name: &str) -> FieldResult<()> {
        let mut entries = write_lock(&self.entries, "registering field")?;
        entries.entry(name.to_owned()).or_default();
        Ok(())
    }

    pub fn get_value(&self, name: &str) -> FieldResult<Value> {
        Ok(read_lock(&self.entries, "reading field value")?
            .get(name)
            .map(|entry| entry.value.clone())
            .unwrap_or(Value::Null))
    }

    pub fn set_value(&self, name: &str, value: Value) -> FieldResult<()> {
        let mut entries = write_lock(&self.entries, "writing field value")?;
        entries.entry(name.to_owned()).or_default().value = value;
        Ok(())
    }

    /// Writes a field's validity. Message and key are retained only on an
    /// explicit failure; `None` marks the field as not yet known.
    pub fn set_valid(
        &self,
        name: &str,
        valid: Option<bool>,
        message: Option<String>,
        key: Option<SmolStr>,
    ) -> FieldResult<()> {
        let mut entries = write_lock(&self.entries, "writing field validity")?;
        let entry = entries.entry(name.to_owned()).or_default();
        entry.valid = valid;
        if valid == Some(false) {
            entry.message = message;
            entry.error_key = key;
        } else {
            entry.message = None;
            entry.error_key = None;
        }
        Ok(())
    }

    pub fn is_field_valid(&self, name: &str) -> FieldResult<Option<bool>> {
        Ok(read_lock(&self.entries, "reading field validity")?
            .get(name)
            .and_then(|entry| entry.valid))
    }

    pub fn get_error(&self, name: &str) -> FieldResult<Option<String>> {
        Ok(read_lock(&self.entries, "reading field error")?
            .get(name)
            .and_then(|entry| entry.message.clone()))
    }

    pub fn get_error_key(&self, name: &str) -> FieldResult<Option<SmolStr>> {
        Ok(read_lock(&self.entries, "reading field error key")?
            .get(name)
            .and_then(|entry| entry.error_key.clone()))
    }

    /// Read-only snapshot of every registered field's current value, used by
    /// cross-field rules.
    pub fn all_values(&self) -> FieldResult<BTreeMap<String, Value>> {
        Ok(read_lock(&self.entries, "snapshotting field values")?
            .iter()
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect())
    }

    /// Form-level validity: the AND over all registered fields. A field that
    /// has never finished validating counts as invalid for submission.
    pub fn is_valid(&self) -> FieldResult<bool> {
        Ok(read_lock(&self.entries, "reading form validity")?
            .values()
            .all(|entry| entry.valid == Some(true)))
    }

    pub fn fields_valid(&self, names: &[&str]) -> FieldResult<bool> {
        let entries = read_lock(&self.entries, "reading named field validity")?;
        Ok(names
            .iter()
            .all(|name| entries.get(*name).is_some_and(|entry| entry.valid == Some(true))))
    }

    /// Clears every field back to its registered-but-unvalidated state,
    /// skipping the named exceptions.
    pub fn reset(&self, except: &[&str]) -> FieldResult<()> {
        let mut entries = write_lock(&self.entries, "resetting form")?;
        for (name, entry) in entries.iter_mut() {
            if except.contains(&name.as_str()) {
                continue;
            }
            *entry = FieldEntry::default();
        }
        Ok(())
    }
}
