//! The schema-validation seam.
//!
//! The runtime never depends on a concrete schema library; payload and
//! aggregate schemas are anything implementing [`Validator`]. The bundled
//! [`TypedSchema`] adapter turns any serde type into a schema, which covers
//! the common case of statically typed payloads without further plumbing.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// One reason a value failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted path into the value, empty for whole-value issues.
    pub path: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl ValidationIssue {
    /// Build an issue rooted at the whole value.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            path: String::new(),
            message: message.into(),
        }
    }
}

/// The issue list produced by a failed [`Validator::parse`].
///
/// Surfaced as the `source` of
/// [`DispatchError::InvalidInput`](crate::DispatchError::InvalidInput) so
/// callers can recover the individual diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssues(pub Vec<ValidationIssue>);

impl std::error::Error for ValidationIssues {}

impl std::fmt::Display for ValidationIssues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} validation issue(s)", self.0.len())?;
        for issue in &self.0 {
            if issue.path.is_empty() {
                write!(f, "; {}", issue.message)?;
            } else {
                write!(f, "; {}: {}", issue.path, issue.message)?;
            }
        }
        Ok(())
    }
}

/// A pluggable schema.
///
/// `parse` either returns the (possibly transformed) value or the list of
/// issues explaining the rejection -- the `parse`/`safeParse` contract of
/// dynamic schema libraries folded into one `Result`.
pub trait Validator: Send + Sync {
    /// Validate `value`, returning the value to persist on success.
    fn parse(&self, value: &Value) -> Result<Value, ValidationIssues>;
}

/// A [`Validator`] derived from a serde type.
///
/// Validates by deserializing the value into `T` and serializing it back,
/// so unknown shapes are rejected with serde's diagnostics and the output
/// is normalized to exactly what `T` serializes as. Fields typed as
/// `chrono::DateTime<Utc>` accept and re-emit ISO-8601 UTC strings, which
/// is how timestamp payload fields stay timestamps across persistence.
///
/// # Examples
///
/// ```
/// use driftsync::{TypedSchema, Validator};
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
///
/// #[derive(Serialize, Deserialize)]
/// struct CreateProfile {
///     name: String,
/// }
///
/// let schema = TypedSchema::<CreateProfile>::new();
/// assert!(schema.parse(&json!({"name": "ada"})).is_ok());
/// assert!(schema.parse(&json!({"name": 7})).is_err());
/// ```
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    /// Build the schema. Zero-sized; `new` exists for turbofish ergonomics.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Validator for TypedSchema<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn parse(&self, value: &Value) -> Result<Value, ValidationIssues> {
        let typed: T = serde_json::from_value(value.clone())
            .map_err(|e| ValidationIssues(vec![ValidationIssue::new(e.to_string())]))?;
        serde_json::to_value(&typed)
            .map_err(|e| ValidationIssues(vec![ValidationIssue::new(e.to_string())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Reminder {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        due_at: Option<DateTime<Utc>>,
    }

    #[test]
    fn accepts_conforming_value() {
        let schema = TypedSchema::<Reminder>::new();
        let parsed = schema
            .parse(&json!({"text": "water plants"}))
            .expect("conforming value should parse");
        assert_eq!(parsed, json!({"text": "water plants"}));
    }

    #[test]
    fn rejects_wrong_type_with_issue() {
        let schema = TypedSchema::<Reminder>::new();
        let err = schema
            .parse(&json!({"text": 42}))
            .expect_err("wrong type should fail");
        assert_eq!(err.0.len(), 1);
        assert!(err.0[0].message.contains("invalid type"), "got: {err}");
    }

    #[test]
    fn rejects_missing_field() {
        let schema = TypedSchema::<Reminder>::new();
        assert!(schema.parse(&json!({})).is_err());
    }

    #[test]
    fn normalizes_unknown_fields_away() {
        // serde's default behavior drops unknown fields on the way through,
        // so the persisted value is exactly the declared shape.
        let schema = TypedSchema::<Reminder>::new();
        let parsed = schema
            .parse(&json!({"text": "x", "extra": true}))
            .expect("should parse");
        assert_eq!(parsed, json!({"text": "x"}));
    }

    #[test]
    fn iso_timestamps_survive_the_roundtrip() {
        let schema = TypedSchema::<Reminder>::new();
        let parsed = schema
            .parse(&json!({"text": "x", "due_at": "2026-08-02T09:30:00.000Z"}))
            .expect("should parse");
        let revived: DateTime<Utc> = serde_json::from_value(parsed["due_at"].clone())
            .expect("timestamp should revive");
        assert_eq!(revived.timestamp(), 1_785_663_000);
    }

    #[test]
    fn issues_display_lists_each_issue() {
        let issues = ValidationIssues(vec![
            ValidationIssue {
                path: "name".to_string(),
                message: "required".to_string(),
            },
            ValidationIssue::new("too large"),
        ]);
        let rendered = issues.to_string();
        assert!(rendered.contains("2 validation issue(s)"), "got: {rendered}");
        assert!(rendered.contains("name: required"), "got: {rendered}");
        assert!(rendered.contains("too large"), "got: {rendered}");
    }
}
