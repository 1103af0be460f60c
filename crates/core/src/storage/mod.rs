//! Interfaces to the local document store: etag-ordered enumeration and change notifications.

mod error;
mod traits;
mod types;

pub use error::StorageError;
pub use traits::*;
pub use types::*;
