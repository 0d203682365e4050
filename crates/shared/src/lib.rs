//! courier-shared: identifiers, the node tree value, and constants shared by
//! the crypto and client crates.

pub mod codec;
pub mod constants;
pub mod error;
pub mod ids;
pub mod node;
