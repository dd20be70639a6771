//! Domain models for the inventory pipeline
//!
//! Records, change records, mutations and alert events.

mod alert;
mod mutation;
mod record;
mod types;

pub use alert::*;
pub use mutation::*;
pub use record::*;
pub use types::*;
