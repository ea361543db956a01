#![doc = include_str!("../README.md")]

pub mod config;
pub mod dataset;
pub mod logging;
pub mod pipeline;
pub mod transport;

mod error;
pub use error::{ParcelMapError, ParcelMapResult};
