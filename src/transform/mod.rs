//! Record-to-record stages.

mod lookup;
mod map;

pub use lookup::Lookup;
pub use map::RowTransform;
