//! Bin numbering and compact bin sets for addressing chunks of a live stream.

mod bin;
mod iterator;
mod map;

pub use bin::Bin;
pub use iterator::{BinCursor, BinIterator, IntersectionIterator};
pub use map::BinMap;
