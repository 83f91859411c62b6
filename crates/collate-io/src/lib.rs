//! # collate-io: The Engine of COLLATE
//!
//! - [`source`]: the [`RecordSource`] trait and the built-in adapters.
//! - [`aggregate`]: concurrent fan-out over parent keys that survives
//!   individual fetch failures.
//! - [`controller`]: owns the aggregated snapshot and serves queries over
//!   it, discarding results of runs that were overtaken by a newer one.

pub mod aggregate;
pub mod controller;
pub mod source;

pub use aggregate::{AggregateError, Aggregation, Aggregator, AggregatorConfig, FetchOutcome};
pub use controller::{ControllerError, Phase, QueryController};
pub use source::{extract_records, FnSource, JsonDirSource, RecordSource, SourceError};
