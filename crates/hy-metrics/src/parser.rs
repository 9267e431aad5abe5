use chrono::{DateTime, Utc};
use hy_types::{DataError, MetricPoint, Observation};
use tracing::{debug, warn};

/// Result of parsing a block of log text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedLog {
    pub observation: Observation,
    /// First malformed input encountered, if any.
    pub error: Option<DataError>,
}

impl ParsedLog {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Incremental metrics parser.
///
/// Feed it one line at a time; it keeps the accumulated observation and the
/// first error, and hands back the points each line produced so a collector
/// can report them as they arrive.
#[derive(Debug, Clone)]
pub struct MetricsLogParser {
    metric_names: Vec<String>,
    observation: Observation,
    first_error: Option<DataError>,
    line_number: usize,
}

impl MetricsLogParser {
    pub fn new(objective: &str, additional: &[String]) -> Self {
        let mut metric_names = vec![objective.to_string()];
        metric_names.extend(additional.iter().cloned());
        Self {
            metric_names,
            observation: Observation::new(),
            first_error: None,
            line_number: 0,
        }
    }

    /// Parse one line and return the points it contributed.
    pub fn feed_line(&mut self, line: &str) -> Observation {
        self.line_number += 1;
        let mut produced = Observation::new();

        let line = line.trim();
        if line.is_empty() {
            return produced;
        }

        let mut tokens = line.split_whitespace().peekable();
        let timestamp = match tokens.peek().and_then(|first| parse_timestamp(first)) {
            Some(ts) => {
                tokens.next();
                Some(ts)
            }
            None => {
                let token = tokens.peek().copied().unwrap_or_default().to_string();
                debug!(line = self.line_number, %token, "no timestamp on metrics line");
                self.record(DataError::InvalidTimestamp {
                    line: self.line_number,
                    token,
                });
                None
            }
        };

        for token in tokens {
            let mut parts = token.split('=');
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            if parts.next().is_some() {
                warn!(line = self.line_number, %token, "ignoring trailing garbage");
                self.record(DataError::TrailingGarbage {
                    line: self.line_number,
                    token: token.to_string(),
                });
                continue;
            }
            if value.is_empty() || !self.metric_names.iter().any(|name| name == key) {
                continue;
            }
            produced.push(key, MetricPoint::new(timestamp, value));
        }

        self.observation.extend(produced.clone());
        produced
    }

    /// Everything parsed so far.
    pub fn observation(&self) -> &Observation {
        &self.observation
    }

    pub fn first_error(&self) -> Option<&DataError> {
        self.first_error.as_ref()
    }

    pub fn finish(self) -> ParsedLog {
        ParsedLog {
            observation: self.observation,
            error: self.first_error,
        }
    }

    fn record(&mut self, error: DataError) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }
}

fn parse_timestamp(token: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a whole block of log text.
pub fn parse_metrics_log(text: &str, objective: &str, additional: &[String]) -> ParsedLog {
    let mut parser = MetricsLogParser::new(objective, additional);
    for line in text.lines() {
        parser.feed_line(line);
    }
    let parsed = parser.finish();
    if let Some(error) = &parsed.error {
        warn!(
            points = parsed.observation.len(),
            %error,
            "metrics log parsed with errors"
        );
    }
    parsed
}
