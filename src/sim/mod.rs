pub mod distribution;
pub mod engine;
pub mod rng;

pub use distribution::{DataQuality, Histogram, Metric, SimulationRun, SimulationSummary};
pub use engine::{CancelToken, MatchupInput, SimulationConfig, SimulationEngine, SimulationError};
