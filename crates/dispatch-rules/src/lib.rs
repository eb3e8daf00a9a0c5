//! Provider rule engine for the delivery dispatcher.
//!
//! Selection is a pure function of the order, a rule snapshot and the
//! evaluation instant: the same inputs always yield the same ordered list,
//! so a replayed order walks the same fallback sequence.

use chrono::{DateTime, Utc};
use dispatch_types::{AreaConfig, GeoPoint, NewOrder, Order, ProviderRule, RuleConfig, UNASSIGNED_AREA};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
	/// No eligible candidate remains for the order's area.
	#[error("No provider available for area '{0}'")]
	NoProviderAvailable(String),
}

/// Ordered candidate providers for `order`: eligible entries of its area
/// (or of the default list when the area is not configured), by descending
/// priority with ties broken by ascending provider id.
pub fn select_providers(
	order: &Order,
	rules: &RuleConfig,
	now: DateTime<Utc>,
) -> Result<Vec<String>, RuleError> {
	rank(&order.demographic_area, rules, now, &HashSet::new())
}

/// Like [`select_providers`] but never returns a provider the order already
/// attempted.
pub fn select_fallback(
	order: &Order,
	rules: &RuleConfig,
	now: DateTime<Utc>,
) -> Result<Vec<String>, RuleError> {
	let attempted: HashSet<&str> = order.attempted_providers.iter().map(String::as_str).collect();
	rank(&order.demographic_area, rules, now, &attempted)
}

fn rank(
	area: &str,
	rules: &RuleConfig,
	now: DateTime<Utc>,
	exclude: &HashSet<&str>,
) -> Result<Vec<String>, RuleError> {
	let mut eligible: Vec<&ProviderRule> = rules
		.rules_for(area)
		.iter()
		.filter(|rule| rule.is_eligible(now) && !exclude.contains(rule.provider.as_str()))
		.collect();

	eligible.sort_by(|a, b| {
		b.priority
			.cmp(&a.priority)
			.then_with(|| a.provider.cmp(&b.provider))
	});

	let mut candidates: Vec<String> = Vec::with_capacity(eligible.len());
	for rule in eligible {
		if !candidates.contains(&rule.provider) {
			candidates.push(rule.provider.clone());
		}
	}

	if candidates.is_empty() {
		tracing::debug!(area = %area, excluded = exclude.len(), "No eligible provider");
		return Err(RuleError::NoProviderAvailable(area.to_string()));
	}
	Ok(candidates)
}

/// First configured area whose box contains `point`.
pub fn resolve_area<'a>(point: &GeoPoint, areas: &'a [AreaConfig]) -> Option<&'a str> {
	areas
		.iter()
		.find(|area| area.contains(point))
		.map(|area| area.name.as_str())
}

/// Area of a new order: the explicit one when given, otherwise the area
/// containing the pickup point, otherwise [`UNASSIGNED_AREA`].
pub fn area_for(request: &NewOrder, areas: &[AreaConfig]) -> String {
	request
		.demographic_area
		.as_deref()
		.filter(|area| !area.is_empty())
		.or_else(|| resolve_area(&request.pickup_location, areas))
		.unwrap_or(UNASSIGNED_AREA)
		.to_string()
}
