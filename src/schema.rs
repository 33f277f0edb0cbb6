//! Payload schemas.
//!
//! Every task declares the shape of its JSON payload. The schema is checked
//! before the executor runs so that bad input fails fast with a
//! [`JobError::Validation`] listing every offending field.
//!
//! ```rust
//! use jobsmith::schema::{FieldSpec, PayloadSchema};
//! use serde_json::json;
//!
//! let schema = PayloadSchema::new()
//!     .field("userId", FieldSpec::string().min_length(1))
//!     .field("type", FieldSpec::string().one_of(["email", "sms", "push"]));
//!
//! assert!(schema.validate("notify", &json!({"userId": "u1", "type": "sms"})).is_ok());
//! assert!(schema.validate("notify", &json!({"type": "fax"})).is_err());
//! ```

use crate::error::{FieldViolation, JobError, JobResult};
use serde_json::Value;

/// JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string
    String,
    /// Any JSON number
    Number,
    /// JSON number without a fractional part
    Integer,
    /// JSON boolean
    Boolean,
    /// JSON object
    Object,
    /// JSON array
    Array,
    /// Anything
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "a string",
            FieldType::Number => "a number",
            FieldType::Integer => "an integer",
            FieldType::Boolean => "a boolean",
            FieldType::Object => "an object",
            FieldType::Array => "an array",
            FieldType::Any => "any value",
        }
    }
}

/// Type and constraints of one payload field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    ty: FieldType,
    required: bool,
    nullable: bool,
    min_length: Option<usize>,
    max_length: Option<usize>,
    one_of: Option<Vec<String>>,
    min: Option<f64>,
    max: Option<f64>,
    path_segment: bool,
}

impl FieldSpec {
    /// A required field of the given type.
    pub fn of(ty: FieldType) -> Self {
        Self {
            ty,
            required: true,
            nullable: false,
            min_length: None,
            max_length: None,
            one_of: None,
            min: None,
            max: None,
            path_segment: false,
        }
    }

    /// A required string field.
    pub fn string() -> Self {
        Self::of(FieldType::String)
    }

    /// A required number field.
    pub fn number() -> Self {
        Self::of(FieldType::Number)
    }

    /// A required integer field.
    pub fn integer() -> Self {
        Self::of(FieldType::Integer)
    }

    /// A required boolean field.
    pub fn boolean() -> Self {
        Self::of(FieldType::Boolean)
    }

    /// A required object field.
    pub fn object() -> Self {
        Self::of(FieldType::Object)
    }

    /// A required array field.
    pub fn array() -> Self {
        Self::of(FieldType::Array)
    }

    /// Allow the field to be absent.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Allow an explicit `null`.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Minimum length of a string (in characters) or array.
    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    /// Maximum length of a string (in characters) or array.
    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Restrict a string to a fixed set of values.
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.one_of = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Inclusive lower bound for numbers.
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Inclusive upper bound for numbers.
    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Require a string usable as one path segment: no separators, no
    /// control characters, and not `.` or `..`.
    pub fn path_segment(mut self) -> Self {
        self.path_segment = true;
        self
    }

    fn check(&self, name: &str, value: Option<&Value>, violations: &mut Vec<FieldViolation>) {
        let mut reject = |reason: String| {
            violations.push(FieldViolation {
                field: name.to_string(),
                reason,
            })
        };

        let value = match value {
            None if self.required => return reject("is required".to_string()),
            None => return,
            Some(Value::Null) if self.nullable || !self.required => return,
            Some(Value::Null) => return reject("must not be null".to_string()),
            Some(value) => value,
        };

        if !self.ty.matches(value) {
            return reject(format!("must be {}", self.ty.name()));
        }

        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let (Some(len), Some(min)) = (length, self.min_length) {
            if len < min {
                reject(format!("must have at least {min} characters or items"));
            }
        }
        if let (Some(len), Some(max)) = (length, self.max_length) {
            if len > max {
                reject(format!("must have at most {max} characters or items"));
            }
        }

        if let (Value::String(s), Some(allowed)) = (value, &self.one_of) {
            if !allowed.iter().any(|a| a == s) {
                reject(format!("must be one of {}", allowed.join(", ")));
            }
        }

        if let (Value::String(s), true) = (value, self.path_segment) {
            if !is_path_segment(s) {
                reject("must not contain path separators, control characters or '..'".to_string());
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min.filter(|min| n < *min) {
                reject(format!("must be >= {min}"));
            }
            if let Some(max) = self.max.filter(|max| n > *max) {
                reject(format!("must be <= {max}"));
            }
        }
    }
}

fn is_path_segment(s: &str) -> bool {
    s != "."
        && s != ".."
        && !s.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

/// Schema of a task payload: an object with named, typed fields.
#[derive(Debug, Clone, Default)]
pub struct PayloadSchema {
    fields: Vec<(String, FieldSpec)>,
    deny_unknown: bool,
    any: bool,
}

impl PayloadSchema {
    /// An object schema with no declared fields yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A schema that accepts any JSON value, including non-objects.
    pub fn any() -> Self {
        Self {
            any: true,
            ..Self::default()
        }
    }

    /// Declare a field. Declaring the same name twice replaces the first spec.
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        self.fields.retain(|(existing, _)| *existing != name);
        self.fields.push((name, spec));
        self
    }

    /// Reject fields that are not declared.
    pub fn deny_unknown_fields(mut self) -> Self {
        self.deny_unknown = true;
        self
    }

    /// Names of the declared fields, in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Check a payload, collecting every violation.
    pub fn validate(&self, task_id: &str, payload: &Value) -> JobResult<()> {
        if self.any {
            return Ok(());
        }

        let Some(object) = payload.as_object() else {
            return Err(JobError::invalid_field(task_id, "$", "payload must be a JSON object"));
        };

        let mut violations = Vec::new();
        for (name, spec) in &self.fields {
            spec.check(name, object.get(name), &mut violations);
        }

        if self.deny_unknown {
            for key in object.keys() {
                if !self.fields.iter().any(|(name, _)| name == key) {
                    violations.push(FieldViolation {
                        field: key.clone(),
                        reason: "is not allowed".to_string(),
                    });
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(JobError::Validation {
                task_id: task_id.to_string(),
                violations,
            })
        }
    }
}
