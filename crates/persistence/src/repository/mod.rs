//! Repository implementations for database operations

pub mod snapshots;
pub mod trades;
pub mod weights;

pub use snapshots::*;
pub use trades::*;
pub use weights::*;
