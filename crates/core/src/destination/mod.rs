//! Destination writers, expressed as strategy values selected by destination kind.

mod error;
mod traits;

pub use error::LoadError;
pub use traits::{Destination, DestinationFactory};
