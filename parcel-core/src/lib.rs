#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

/// Durable per-stage progress ledger
pub mod checkpoint;

/// Flattening of remote attribute responses into records
pub mod enrich;

/// Bounded, rate-limited request pool
pub mod fetch;

/// Projection and repair of parcel polygons
pub mod geometry;

/// Parcel records and their deduplication
pub mod parcels;

/// Counters and end-of-stage reports
pub mod stats;

/// Vector tile decoding and the tile grid walker
pub mod tiles;

mod error;
pub use error::{ParcelCoreError, ParcelCoreResult};
