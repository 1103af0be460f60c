//! Task definitions: configurations, their transformations and the database record holding them.

mod types;

pub use types::*;
