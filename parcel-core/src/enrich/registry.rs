use std::borrow::Cow;
use std::collections::HashMap;

use super::{EnrichmentRecord, FieldValue, RESERVED_FIELDS};

/// The union of attribute names of a run, in the order they were first seen.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl FieldRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the attribute names of a record that are new.
    pub fn observe(&mut self, record: &EnrichmentRecord) {
        for (name, _) in &record.attributes {
            if !self.positions.contains_key(name) {
                self.positions.insert(name.clone(), self.names.len());
                self.names.push(name.clone());
            }
        }
    }

    /// Attribute columns, without the reserved ones.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.names
    }

    /// Full CSV header: the reserved columns, then the attributes.
    #[must_use]
    pub fn header(&self) -> Vec<&str> {
        RESERVED_FIELDS
            .iter()
            .copied()
            .chain(self.names.iter().map(String::as_str))
            .collect()
    }

    /// CSV cells of a record, aligned with [`Self::header`]. Missing attributes are empty.
    ///
    /// `location` is the `[latitude, longitude]` text of the parcel in the input dataset.
    #[must_use]
    pub fn row<'a>(
        &self,
        record: &'a EnrichmentRecord,
        location: [&'a str; 2],
    ) -> Vec<Cow<'a, str>> {
        let mut values: Vec<Option<&FieldValue>> = vec![None; self.names.len()];
        for (name, value) in &record.attributes {
            if let Some(&pos) = self.positions.get(name) {
                values[pos] = Some(value);
            }
        }
        let mut row = Vec::with_capacity(RESERVED_FIELDS.len() + values.len());
        row.push(Cow::Borrowed(record.parcel_id.as_str()));
        row.extend(location.map(Cow::Borrowed));
        row.push(Cow::Owned(record.rule_index.to_string()));
        row.push(Cow::Borrowed(record.api_status.as_str()));
        row.extend(values.into_iter().map(|v| v.map_or(Cow::Borrowed(""), FieldValue::as_cell)));
        row
    }

    /// Number of attribute columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when no attribute was seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
