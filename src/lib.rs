//! Sightline library crate
//!
//! Re-exports core modules for the service binary and integration tests.

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod feedback;
pub mod location;
pub mod recommendation;

// Re-export commonly used types
pub use catalog::{CatalogProvider, InMemoryCatalog};
pub use config::Config;
pub use error::{Error, Result};
pub use feedback::{FeedbackStore, InMemoryFeedbackStore};
pub use recommendation::engine::{RecommendationEngine, RecommendationRequest, Strategy};
