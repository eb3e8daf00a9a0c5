//! Schema validation for implementation-specific TOML sections.
//!
//! Every storage backend, queue backend and provider adapter describes the
//! keys it accepts with a [`Schema`]. The builder validates the raw section
//! before calling the implementation's factory, so factories can assume
//! well-typed input.

use thiserror::Error;

/// Errors produced while checking a TOML section against a schema.
#[derive(Debug, Error)]
pub enum ValidationError {
	#[error("Missing required field: {0}")]
	MissingField(String),
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
	#[error("Failed to deserialize config: {0}")]
	DeserializationError(String),
}

impl ValidationError {
	/// Prefixes the field path with `parent`.
	fn nested(self, parent: &str) -> Self {
		match self {
			ValidationError::MissingField(f) => {
				ValidationError::MissingField(format!("{}.{}", parent, f))
			},
			ValidationError::InvalidValue { field, message } => ValidationError::InvalidValue {
				field: format!("{}.{}", parent, field),
				message,
			},
			ValidationError::TypeMismatch {
				field,
				expected,
				actual,
			} => ValidationError::TypeMismatch {
				field: format!("{}.{}", parent, field),
				expected,
				actual,
			},
			other => other,
		}
	}
}

/// Expected type of a field.
#[derive(Debug)]
pub enum FieldType {
	String,
	/// Integer with inclusive bounds.
	Integer { min: Option<i64>, max: Option<i64> },
	/// Float with inclusive bounds. Integers are accepted.
	Float { min: Option<f64>, max: Option<f64> },
	Boolean,
	Array(Box<FieldType>),
	/// Nested table with a fixed set of keys.
	Table(Schema),
	/// Table with arbitrary keys whose values all share one type.
	Map(Box<FieldType>),
}

/// Extra check run after the type check passes.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.field("validator", &self.validator.is_some())
			.finish()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, value: &toml::Value) -> Result<(), ValidationError> {
		validate_field_type(&self.name, value, &self.field_type)?;
		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| ValidationError::InvalidValue {
				field: self.name.clone(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of a table.
///
/// Unknown keys are allowed so that sections can carry shared keys such as
/// `implementation`.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	pub fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let table = config
			.as_table()
			.ok_or_else(|| ValidationError::TypeMismatch {
				field: "root".to_string(),
				expected: "table".to_string(),
				actual: config.type_str().to_string(),
			})?;

		for field in &self.required {
			let value = table
				.get(&field.name)
				.ok_or_else(|| ValidationError::MissingField(field.name.clone()))?;
			field.check(value)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(value)?;
			}
		}

		Ok(())
	}
}

fn mismatch(field_name: &str, expected: &str, value: &toml::Value) -> ValidationError {
	ValidationError::TypeMismatch {
		field: field_name.to_string(),
		expected: expected.to_string(),
		actual: value.type_str().to_string(),
	}
}

fn out_of_range<T: std::fmt::Display>(field_name: &str, value: T, bound: T, kind: &str) -> ValidationError {
	ValidationError::InvalidValue {
		field: field_name.to_string(),
		message: format!("Value {} is {} {}", value, kind, bound),
	}
}

fn validate_field_type(
	field_name: &str,
	value: &toml::Value,
	expected_type: &FieldType,
) -> Result<(), ValidationError> {
	match expected_type {
		FieldType::String => {
			if !value.is_str() {
				return Err(mismatch(field_name, "string", value));
			}
		},
		FieldType::Integer { min, max } => {
			let v = value
				.as_integer()
				.ok_or_else(|| mismatch(field_name, "integer", value))?;
			if let Some(min) = min.filter(|min| v < *min) {
				return Err(out_of_range(field_name, v, min, "less than minimum"));
			}
			if let Some(max) = max.filter(|max| v > *max) {
				return Err(out_of_range(field_name, v, max, "greater than maximum"));
			}
		},
		FieldType::Float { min, max } => {
			let v = value
				.as_float()
				.or_else(|| value.as_integer().map(|i| i as f64))
				.ok_or_else(|| mismatch(field_name, "float", value))?;
			if let Some(min) = min.filter(|min| v < *min) {
				return Err(out_of_range(field_name, v, min, "less than minimum"));
			}
			if let Some(max) = max.filter(|max| v > *max) {
				return Err(out_of_range(field_name, v, max, "greater than maximum"));
			}
		},
		FieldType::Boolean => {
			if !value.is_bool() {
				return Err(mismatch(field_name, "boolean", value));
			}
		},
		FieldType::Array(inner) => {
			let array = value
				.as_array()
				.ok_or_else(|| mismatch(field_name, "array", value))?;
			for (i, item) in array.iter().enumerate() {
				validate_field_type(&format!("{}[{}]", field_name, i), item, inner)?;
			}
		},
		FieldType::Table(schema) => {
			schema.validate(value).map_err(|e| e.nested(field_name))?;
		},
		FieldType::Map(inner) => {
			let table = value
				.as_table()
				.ok_or_else(|| mismatch(field_name, "table", value))?;
			for (key, item) in table {
				validate_field_type(&format!("{}.{}", field_name, key), item, inner)?;
			}
		},
	}

	Ok(())
}

/// Implemented by each backend/adapter to describe its configuration.
pub trait ConfigSchema: Send + Sync {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}
