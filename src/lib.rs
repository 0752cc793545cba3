//! `twikwak` links the twitter7 tweet archive with the kwak10 social graph into a gender-annotated social graph.
//!
//! Both datasets are far larger than memory, so every data-bearing step is built on a streaming external
//! sort/merge/join engine:
//!
//! * [`SpillingAccumulator`] collects keyed records in a key-ordered table and spills it to sorted partitions
//!   when available memory drops below a floor or a record limit is exceeded.
//! * [`KWayMerger`] merges any number of sorted partitions into one sorted stream holding every key once, joining
//!   the values of equal keys.
//! * [`join::intersect`] and [`join::enrich`] align sorted files with a single forward pass.
//! * [`Pipeline`] sequences the phases of the linking process under a resumable [`SessionState`].
//!
//! Keys are compared byte-wise everywhere, which matches the order of the system `sort` utility under the C
//! locale, so the [`ExternalSortFacility`] can stand in for the native sorter.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use twikwak::{Config, FnClassifier, Pipeline, SessionState};
//!
//! fn main() {
//!     let config_path = Path::new("cfg.json");
//!     let settings = Config::load(config_path).unwrap().resolve(config_path).unwrap();
//!
//!     let mut pipeline = Pipeline::new(settings, SessionState::new(std::env::args().collect()))
//!         .unwrap()
//!         .with_classifier(Box::new(FnClassifier(|text: &str| {
//!             if text.contains("she") { "1" } else { "0" }.to_string()
//!         })));
//!     pipeline.run_all().unwrap();
//! }
//! ```

pub mod buffer;
pub mod classifier;
pub mod config;
pub mod context;
pub mod join;
pub mod lines;
pub mod merger;
pub mod partition;
pub mod phases;
pub mod record;
pub mod session;
pub mod sort;
pub mod stream;

pub use buffer::{SpillPolicy, SpillingAccumulator};
pub use classifier::{CommandClassifier, FnClassifier, GenderClassifier};
pub use config::{Config, ConfigError, Settings};
pub use context::RunContext;
pub use merger::KWayMerger;
pub use phases::{Pipeline, PipelineError};
pub use record::Record;
pub use session::{PhaseId, SessionState};
pub use sort::{ExternalSortFacility, NativeSorter, NativeSorterBuilder, SortError, Sorter};
