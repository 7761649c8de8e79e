//! Network list filters
//!
//! Values of one key are ORed, different keys are ANDed. Label filters are the
//! exception: every label value must match.

use crate::error::{NetworkError, Result};
use crate::network::types::Network;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::HashMap;

/// Predicate over a network, built by [`generate_filters`].
pub type NetworkFilter = Box<dyn Fn(&Network) -> bool + Send + Sync>;

/// Build one predicate per filter key.
pub fn generate_filters(filters: &HashMap<String, Vec<String>>) -> Result<Vec<NetworkFilter>> {
    let mut out = Vec::with_capacity(filters.len());
    for (key, values) in filters {
        out.push(create_filter(key, values)?);
    }
    Ok(out)
}

/// True when `network` passes every filter.
pub fn matches_all(network: &Network, filters: &[NetworkFilter]) -> bool {
    filters.iter().all(|filter| filter(network))
}

fn create_filter(key: &str, values: &[String]) -> Result<NetworkFilter> {
    let values = values.to_vec();
    let filter: NetworkFilter = match key {
        "name" => {
            let matchers = ValueMatchers::new(values);
            Box::new(move |net: &Network| matchers.any_match(&net.name, false))
        }
        "id" => {
            let matchers = ValueMatchers::new(values);
            Box::new(move |net: &Network| matchers.any_match(&net.id, true))
        }
        "driver" => Box::new(move |net: &Network| values.iter().any(|v| *v == net.driver)),
        "label" => Box::new(move |net: &Network| match_labels(&values, &net.labels)),
        "until" => {
            let until = parse_until(&values)?;
            Box::new(move |net: &Network| net.created.map(|c| c < until).unwrap_or(false))
        }
        _ => {
            return Err(NetworkError::InvalidArgument(format!(
                "invalid filter {:?}",
                key
            )))
        }
    };
    Ok(filter)
}

/// Filter values matched exactly, as prefix (ids only) or as regex.
struct ValueMatchers {
    values: Vec<String>,
    regexes: Vec<Regex>,
}

impl ValueMatchers {
    fn new(values: Vec<String>) -> Self {
        // Values that are not valid regexes still match exactly.
        let regexes = values.iter().filter_map(|v| Regex::new(v).ok()).collect();
        Self { values, regexes }
    }

    fn any_match(&self, candidate: &str, prefix: bool) -> bool {
        self.values
            .iter()
            .any(|v| candidate == v || (prefix && candidate.starts_with(v.as_str())))
            || self.regexes.iter().any(|re| re.is_match(candidate))
    }
}

/// Every `key` or `key=value` entry must be present on the network.
fn match_labels(filters: &[String], labels: &HashMap<String, String>) -> bool {
    filters.iter().all(|filter| match filter.split_once('=') {
        Some((key, value)) => labels.get(key).map(|v| v == value).unwrap_or(false),
        None => labels.contains_key(filter.as_str()),
    })
}

fn parse_until(values: &[String]) -> Result<DateTime<Utc>> {
    let [value] = values else {
        return Err(NetworkError::InvalidArgument(
            "only one until filter value is supported".to_string(),
        ));
    };
    if let Ok(secs) = value.parse::<i64>() {
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| NetworkError::InvalidArgument(format!("invalid until timestamp {}", value)));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| NetworkError::InvalidArgument(format!("invalid until timestamp {}: {}", value, e)))
}
