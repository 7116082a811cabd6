//! Read-mostly registries consulted by the change interceptors.

pub mod descriptor;
pub mod filter;
