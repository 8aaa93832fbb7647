//! Value types exchanged between pipeline stages.

mod action;
mod cell;
mod row;

pub use action::ChangeAction;
pub use cell::Cell;
pub use row::TableRow;

pub(crate) use cell::to_hex as cell_hex;
