//! # hy-metrics
//!
//! Turns unstructured training output into structured metric observations.
//!
//! Each line may start with an RFC3339 timestamp followed by `name=value`
//! tokens. Only tokens naming the objective or one of the additional metrics
//! are kept. Malformed lines never abort parsing: the partial observation is
//! always returned alongside the first problem found.

mod parser;

pub use parser::{parse_metrics_log, MetricsLogParser, ParsedLog};
