//! Recommendation Module
//!
//! Ranks place media for Sightline users.
//!
//! ## Architecture
//!
//! 1. **Model** - Collaborative-filtering rating predictor, swapped in as immutable snapshots
//! 2. **Similarity** - Keyword-category and same-city scorer seeded by a set of media
//! 3. **A/B** - Hash-based user bucketing and explore-half composition
//! 4. **Calendar** - Seasons, weather city groups and the occasion table
//! 5. **Engine** - The named strategies, their fallbacks and the request dispatcher
//!
//! ## Strategies
//!
//! - **Popular**: rating and vote floors, whole catalog as fallback
//! - **Nearest**: one city, ML-ranked when the user is known
//! - **Personalized**: user favourites, then model picks, then look-alikes
//! - **Weather / Occasions**: sectioned lists driven by the calendar
//! - **Random / Similar**: exploration and "more like this"

pub mod ab;
pub mod calendar;
pub mod engine;
pub mod metrics;
pub mod model;
pub mod similarity;
pub mod updater;

// Re-export the types that are actually used externally
pub use engine::{MatchReason, RecommendedItem};
pub use model::{CollaborativeModel, ModelError};
