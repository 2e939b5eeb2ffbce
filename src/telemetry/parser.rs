//! Parser for the compact telemetry line published by the sensor nodes.
//!
//! Format: `"<name>: <number>"` segments separated by commas, for example
//! `"Current Sensor 1: 25.467, Temperature Sensor 1: 30.456"`.
//!
//! Each segment is matched from its start against one pattern. The number is
//! a prefix match, so text after it is ignored (`"12abc"` reads as 12).
//! Segments that do not match are skipped; a payload with no usable segment
//! simply yields no readings.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, error};

/// Lazy name up to the first colon that is followed by a number.
const SEGMENT_PATTERN: &str = r"^(.*?):\s*([-+]?(?:\d*\.\d+|\d+))";

static SEGMENT: OnceLock<Option<Regex>> = OnceLock::new();

fn segment_regex() -> Option<&'static Regex> {
    SEGMENT
        .get_or_init(|| match Regex::new(SEGMENT_PATTERN) {
            Ok(regex) => Some(regex),
            Err(e) => {
                error!("Invalid telemetry segment pattern: {}", e);
                None
            }
        })
        .as_ref()
}

/// Parses a telemetry line into `(name, value)` pairs, preserving order.
pub fn parse(raw: &str) -> Vec<(String, f64)> {
    let Some(regex) = segment_regex() else {
        return Vec::new();
    };

    raw.split(',')
        .map(str::trim)
        .filter_map(|segment| {
            let parsed = parse_segment(regex, segment);
            if parsed.is_none() && !segment.is_empty() {
                debug!("Skipping malformed telemetry segment: {:?}", segment);
            }
            parsed
        })
        .collect()
}

fn parse_segment(regex: &Regex, segment: &str) -> Option<(String, f64)> {
    let captures = regex.captures(segment)?;
    let name = captures.get(1)?.as_str().trim();
    if name.is_empty() {
        return None;
    }
    let value: f64 = captures.get(2)?.as_str().parse().ok()?;
    Some((name.to_string(), value))
}
