//! Request contracts: typed DTO construction and field-level validation.
//!
//! A [`Contract`] is the validated schema of a request DTO. DTOs derive
//! `serde::Deserialize` and are built either from a JSON body or from the
//! merged parameter bags (with scalar coercion); construction failures
//! surface as `BadRequest` carrying the offending field, validation failures
//! as 422 with the full field → messages map.
//!
//! Validation is expressed with a [`Rules`] collector:
//!
//! ```rust
//! use hibana::contract::{Contract, Rules};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct CreateWidget {
//!     name: String,
//!     quantity: i64,
//! }
//!
//! impl Contract for CreateWidget {
//!     fn validate(&self) -> Rules {
//!         let mut rules = Rules::new();
//!         rules.presence("name", &self.name);
//!         rules.length("name", &self.name, Some(2), Some(50));
//!         rules.range("quantity", self.quantity, Some(1), Some(999));
//!         rules
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::de::DeserializeOwned;

use crate::{error::Error, params::Params};

/// A validated request DTO.
pub trait Contract: DeserializeOwned + Send + 'static {
    /// Declares the field rules. The default contract has none.
    fn validate(&self) -> Rules {
        Rules::new()
    }
}

/// Collects field-level validation failures.
///
/// A contract is valid exactly when its rules collected no errors, so
/// `is_valid` and an empty error map are the same statement.
#[derive(Debug, Default)]
pub struct Rules {
    errors: BTreeMap<String, Vec<String>>,
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    /// The value must be non-empty after trimming.
    pub fn presence(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.add(field, "is required");
        }
        self
    }

    /// Character-count bounds, both optional.
    pub fn length(
        &mut self,
        field: &str,
        value: &str,
        min: Option<usize>,
        max: Option<usize>,
    ) -> &mut Self {
        let len = value.chars().count();
        if let Some(min) = min {
            if len < min {
                self.add(field, format!("must be at least {min} characters"));
            }
        }
        if let Some(max) = max {
            if len > max {
                self.add(field, format!("must be at most {max} characters"));
            }
        }
        self
    }

    /// The value must satisfy the predicate; `description` names the
    /// expected format in the failure message.
    pub fn format<F>(&mut self, field: &str, value: &str, matches: F, description: &str) -> &mut Self
    where
        F: Fn(&str) -> bool,
    {
        if !matches(value) {
            self.add(field, format!("must be a valid {description}"));
        }
        self
    }

    /// Numeric bounds, both optional.
    pub fn range<T>(&mut self, field: &str, value: T, min: Option<T>, max: Option<T>) -> &mut Self
    where
        T: PartialOrd + Display,
    {
        if let Some(min) = min {
            if value < min {
                self.add(field, format!("must be at least {min}"));
            }
        }
        if let Some(max) = max {
            if value > max {
                self.add(field, format!("must be at most {max}"));
            }
        }
        self
    }

    /// The value must be one of the allowed options.
    pub fn inclusion(&mut self, field: &str, value: &str, allowed: &[&str]) -> &mut Self {
        if !allowed.contains(&value) {
            self.add(field, format!("must be one of: {}", allowed.join(", ")));
        }
        self
    }

    /// The value must not be one of the reserved options.
    pub fn exclusion(&mut self, field: &str, value: &str, reserved: &[&str]) -> &mut Self {
        if reserved.contains(&value) {
            self.add(field, "is reserved");
        }
        self
    }

    /// Arbitrary rule: records `message` for `field` unless `ok` holds.
    pub fn check(&mut self, field: &str, ok: bool, message: impl Into<String>) -> &mut Self {
        if !ok {
            self.add(field, message);
        }
        self
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &BTreeMap<String, Vec<String>> {
        &self.errors
    }

    /// Resolves the collected rules into a result: `Ok` exactly when no
    /// rule failed, a 422 validation error otherwise.
    pub fn finish(self) -> Result<(), Error> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(self.errors))
        }
    }
}

/// Builds a contract from a JSON request body.
pub fn from_json_slice<T: Contract>(bytes: &[u8]) -> Result<T, Error> {
    let de = &mut serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(de).map_err(|e| {
        let field = field_of(&e);
        let err = Error::bad_request(format!("invalid request body: {}", e.inner()));
        match field {
            Some(field) => err.with_source(field),
            None => err,
        }
    })
}

/// Builds a contract from the merged parameter bags.
pub fn from_params<T: Contract>(params: &Params) -> Result<T, Error> {
    let value = serde_json::Value::Object(params.to_json_map());
    serde_path_to_error::deserialize(value).map_err(|e| {
        let field = field_of(&e);
        let err = Error::bad_request(format!("invalid parameter: {}", e.inner()));
        match field {
            Some(field) => err.with_source(field),
            None => err,
        }
    })
}

/// Extracts the offending field from a deserialization error path, falling
/// back to the backtick-quoted name serde uses for missing fields.
fn field_of<E: Display>(err: &serde_path_to_error::Error<E>) -> Option<String> {
    let path = err.path().to_string();
    if !path.is_empty() && path != "." {
        return Some(path);
    }
    let message = err.inner().to_string();
    let start = message.find('`')? + 1;
    let end = message[start..].find('`')? + start;
    Some(message[start..end].to_string())
}
