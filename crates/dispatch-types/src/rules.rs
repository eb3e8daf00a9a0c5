//! Provider rule configuration.
//!
//! Maps demographic areas to prioritized provider lists. The rule engine
//! only ever reads these values; a new snapshot replaces the old one on
//! reload.

use crate::GeoPoint;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Area assigned to orders whose pickup point falls outside every box.
pub const UNASSIGNED_AREA: &str = "unassigned";

/// A provider entry in an area's candidate list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRule {
	pub provider: String,
	/// Higher runs first.
	#[serde(default)]
	pub priority: i64,
	/// Capacity flag. Disabled entries are never selected.
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub operating_hours: Option<OperatingHours>,
}

fn default_enabled() -> bool {
	true
}

impl ProviderRule {
	pub fn new(provider: impl Into<String>, priority: i64) -> Self {
		Self {
			provider: provider.into(),
			priority,
			enabled: true,
			operating_hours: None,
		}
	}

	/// Eligibility predicate evaluated at `now`.
	pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
		self.enabled
			&& self
				.operating_hours
				.as_ref()
				.is_none_or(|hours| hours.contains(now.time()))
	}
}

/// Daily UTC window `[start, end)`. A window with `start > end` wraps
/// midnight; `start == end` is open all day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
	#[serde(deserialize_with = "deserialize_time")]
	pub start: NaiveTime,
	#[serde(deserialize_with = "deserialize_time")]
	pub end: NaiveTime,
}

impl OperatingHours {
	pub fn contains(&self, t: NaiveTime) -> bool {
		if self.start == self.end {
			true
		} else if self.start < self.end {
			self.start <= t && t < self.end
		} else {
			t >= self.start || t < self.end
		}
	}
}

/// Accepts `HH:MM` as well as `HH:MM:SS`.
fn deserialize_time<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = String::deserialize(deserializer)?;
	NaiveTime::parse_from_str(&raw, "%H:%M:%S")
		.or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M"))
		.map_err(|e| serde::de::Error::custom(format!("invalid time '{}': {}", raw, e)))
}

/// Area to candidate-list mapping plus the default list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
	/// Used when an order's area has no entry.
	#[serde(default)]
	pub default: Vec<ProviderRule>,
	#[serde(default)]
	pub areas: HashMap<String, Vec<ProviderRule>>,
}

impl RuleConfig {
	/// Candidate list for `area`, or the default list when the area is absent.
	pub fn rules_for(&self, area: &str) -> &[ProviderRule] {
		self.areas
			.get(area)
			.map(Vec::as_slice)
			.unwrap_or(&self.default)
	}

	/// Every provider id referenced anywhere in the table.
	pub fn referenced_providers(&self) -> impl Iterator<Item = &str> {
		self.default
			.iter()
			.chain(self.areas.values().flatten())
			.map(|rule| rule.provider.as_str())
	}
}

/// Bounding box of a demographic area. Bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaConfig {
	pub name: String,
	pub min_lat: f64,
	pub max_lat: f64,
	pub min_long: f64,
	pub max_long: f64,
}

impl AreaConfig {
	pub fn contains(&self, point: &GeoPoint) -> bool {
		(self.min_lat..=self.max_lat).contains(&point.lat)
			&& (self.min_long..=self.max_long).contains(&point.long)
	}
}
