//! Configuration module.

mod exclusion;
mod loader;
mod types;

pub use exclusion::ExclusionList;
pub use loader::*;
pub use types::*;
