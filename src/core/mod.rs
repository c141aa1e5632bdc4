//! Core deterministic primitives.
//!
//! Grid geometry, peer identifiers and domain-separated hashing shared by
//! every other layer.

pub mod hash;
pub mod id;
pub mod point;

// Re-export core types
pub use hash::{DomainHasher, Hash32, hash_with_domain};
pub use id::PeerId;
pub use point::{Bounds, GridPoint};
