pub mod clock;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod ledger;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod spatial;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use engine::{MatchingEngine, MatchingEngineBuilder};
pub use error::{MatchError, Result, StoreError};
