pub mod collector;
pub mod definition;
pub mod error;
pub mod mapping;
pub mod model;
pub mod runner;

pub use collector::{CollectionOutcome, QueryCollector, Scrape, ThrottleState};
pub use definition::{DefinitionKind, MetricDefinition, MetricKind};
pub use error::{CollectError, MapError, RunError};
pub use mapping::{Sample, map_rows};
pub use model::{ResultSet, Row};
pub use runner::Runner;
