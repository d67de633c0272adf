pub mod evaluator;
pub mod kelly;
pub mod odds;
pub mod paper_trade;
pub mod pipeline;
pub mod recommend;

pub use evaluator::{evaluate, EvaluatedMarket, EvaluatorConfig};
pub use pipeline::{ForecastEngine, PublishedRuns};
pub use recommend::{recommend, BatchContext, Recommendation, SizingConfig};
