pub mod mvt;

mod walker;
pub use walker::{TileGridWalker, TileProcessor};
