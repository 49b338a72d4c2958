//! Terminal output for the operator binary

pub mod colours;
pub mod table;

pub use colours::ColourManager;
pub use table::{CellStyle, TableBuilder};
