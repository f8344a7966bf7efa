//! Arcconf Types
//!
//! Shared type definitions for identifiers and conference events
//! used across the arcconf conference gateway services.

pub mod error;
pub mod events;
pub mod ids;

pub use error::*;
pub use events::*;
pub use ids::*;
