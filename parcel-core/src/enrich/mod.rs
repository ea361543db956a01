//! Turning remote attribute responses into table rows.
//!
//! Nothing here knows the remote schema. Each response is flattened on one designated list
//! field: a parcel with several regulation rules ("mixed use") yields one [`EnrichmentRecord`]
//! per rule, each repeating the parcel-level fields. A run-wide [`FieldRegistry`] collects the
//! union of attribute names in the order they were first seen and lines records up into
//! columns, filling gaps with nulls. Every record carries the [`ApiStatus`] of its request, so
//! parcels the API had nothing for still show up in the output.

mod normalize;
pub use normalize::{
    ApiStatus, EnrichmentRecord, FieldValue, Normalized, RESERVED_FIELDS, SchemaError, VALUE_FIELD,
    normalize_response,
};

mod registry;
pub use registry::FieldRegistry;

mod runner;
pub use runner::{EnrichmentRunner, assemble};
