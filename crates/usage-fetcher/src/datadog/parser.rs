//! Datadog response parser.
//!
//! Turns a query response into observations:
//! - the series scope names the resource and feature
//! - the unit comes from configuration or from the first series
//! - each non-null point becomes one observation at its own timestamp

use chrono::DateTime;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, warn};
use usage_common::{AppFeature, Observation, ResourceId, UsageUnit};

use super::api::{QueryResponse, Series};
use super::error::DatadogError;

/// Scope tag naming the shared resource.
pub const RESOURCE_TAG: &str = "shared_resource_id";

/// Scope tag naming the app feature.
pub const FEATURE_TAG: &str = "app_feature";

/// A query is usable only if it groups by both scope tags.
pub fn is_valid_query(query: &str) -> bool {
    query.contains(RESOURCE_TAG) && query.contains(FEATURE_TAG)
}

/// Extract the series list, rejecting error responses and empty results.
pub fn response_series(response: QueryResponse) -> Result<Vec<Series>, DatadogError> {
    if let Some(error) = response.error.filter(|e| !e.is_empty()) {
        return Err(DatadogError::QueryError(error));
    }
    match response.series {
        Some(series) if !series.is_empty() => Ok(series),
        _ => Err(DatadogError::NoData),
    }
}

/// Parse a `"k: v, k2: v2"` scope into a map.
///
/// Both scope tags must be present.
pub fn parse_scope(scope: &str) -> Result<HashMap<String, String>, DatadogError> {
    let tags: HashMap<String, String> = scope
        .split(',')
        .filter_map(|part| part.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    for tag in [RESOURCE_TAG, FEATURE_TAG] {
        if !tags.contains_key(tag) {
            return Err(DatadogError::MissingScopeTag {
                scope: scope.to_string(),
                tag,
            });
        }
    }
    Ok(tags)
}

/// Unit plural reported on the first series, if any.
fn reported_unit(series: &[Series]) -> Option<&str> {
    series
        .first()?
        .unit
        .as_ref()?
        .first()?
        .as_ref()?
        .plural
        .as_deref()
}

/// Decide the unit for a response.
///
/// A configured unit wins; a different reported unit only logs a warning.
pub fn resolve_unit(series: &[Series], configured: Option<&str>) -> Result<UsageUnit, DatadogError> {
    let reported = reported_unit(series);

    if let Some(units) = series.first().and_then(|s| s.unit.as_ref()) {
        if units.get(1).map_or(false, Option::is_some) {
            warn!(?units, "Received multiple units from Datadog");
        }
    }

    let unit = match (configured, reported) {
        (Some(configured), reported) => {
            if let Some(reported) = reported {
                if !configured.eq_ignore_ascii_case(reported) {
                    warn!(configured, reported, "Configured unit differs from the one reported by Datadog");
                }
            }
            configured
        }
        (None, Some(reported)) => reported,
        (None, None) => return Err(DatadogError::InvalidResponse("no unit found in response".into())),
    };

    UsageUnit::from_str(unit).map_err(|_| DatadogError::UnsupportedUnit(unit.to_string()))
}

/// Convert series into observations.
///
/// Series whose resource is unknown and has no override are skipped, as are
/// null and negative points.
pub fn series_observations(
    series: &[Series],
    unit: UsageUnit,
    resource_override: Option<ResourceId>,
) -> Result<Vec<Observation>, DatadogError> {
    let mut observations = Vec::new();

    for s in series {
        let tags = parse_scope(&s.scope)?;
        let raw_resource = &tags[RESOURCE_TAG];
        let feature = AppFeature::new(tags[FEATURE_TAG].as_str())
            .map_err(|e| DatadogError::InvalidResponse(e.to_string()))?;

        let resource = match (ResourceId::from_str(raw_resource), resource_override) {
            (Ok(resource), _) => resource,
            (Err(_), Some(resource)) => resource,
            (Err(_), None) => {
                warn!(shared_resource_id = %raw_resource, "Unknown resource without override, skipping series");
                continue;
            }
        };

        for &(timestamp_ms, value) in &s.pointlist {
            let Some(value) = value else {
                continue;
            };
            let Some(observed_at) = DateTime::from_timestamp_millis(timestamp_ms as i64) else {
                warn!(timestamp_ms, "Point timestamp out of range, skipping");
                continue;
            };
            let amount = match Decimal::try_from(value) {
                Ok(amount) => amount,
                Err(_) => {
                    warn!(value, "Point value is not a finite number, skipping");
                    continue;
                }
            };
            match Observation::new(resource, feature.clone(), amount, unit, observed_at) {
                Ok(observation) => observations.push(observation),
                Err(e) => warn!(error = %e, "Skipping point"),
            }
        }
    }

    debug!(count = observations.len(), "Parsed Datadog observations");
    Ok(observations)
}
