//! Field-level validation for decoded requests and outgoing responses
//!
//! A [`Validator`] is built explicitly and handed to whatever needs it, so
//! tests can swap in a stricter or looser rule set without touching globals.
//! Out of the box it only checks that required fields are present; address
//! format and field length rules are opt-in.
use super::error::{FieldError, ValidationError};
use uuid::Uuid;

/// Implemented by every type that passes through the request adapter.
pub trait Validate {
    fn validate(&self, check: &mut Checker<'_>);
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    max_field_len: Option<usize>,
    email_format: bool,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects string fields longer than `max_field_len` bytes.
    pub fn with_max_field_len(mut self, max_field_len: usize) -> Self {
        self.max_field_len = Some(max_field_len);
        self
    }

    /// Requires address fields to look like `local@domain.tld`. Off by
    /// default, where addresses only have to be present.
    pub fn with_email_format(mut self, enabled: bool) -> Self {
        self.email_format = enabled;
        self
    }

    /// Runs every rule declared by `value`, collecting all failures rather
    /// than stopping at the first one.
    pub fn validate<T: Validate + ?Sized>(&self, value: &T) -> Result<(), ValidationError> {
        let mut check = Checker {
            validator: self,
            errors: Vec::new(),
        };
        value.validate(&mut check);

        if check.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                errors: check.errors,
            })
        }
    }
}

pub struct Checker<'a> {
    validator: &'a Validator,
    errors: Vec<FieldError>,
}

impl Checker<'_> {
    pub fn required_str(&mut self, field: &'static str, value: &str) -> &mut Self {
        if value.is_empty() {
            self.fail(field, "is required");
        } else {
            self.max_len(field, value);
        }
        self
    }

    /// The nil UUID is what an absent JSON field decodes to, so it counts as missing.
    pub fn required_uuid(&mut self, field: &'static str, value: &Uuid) -> &mut Self {
        if value.is_nil() {
            self.fail(field, "is required");
        }
        self
    }

    pub fn email(&mut self, field: &'static str, value: &str) -> &mut Self {
        if self.validator.email_format && !value.is_empty() && !looks_like_email(value) {
            self.fail(field, "must be an email address");
        }
        self
    }

    pub fn max_len(&mut self, field: &'static str, value: &str) -> &mut Self {
        match self.validator.max_field_len {
            Some(max) if value.len() > max => {
                self.fail(field, format!("must be at most {max} bytes"));
            }
            _ => {}
        }
        self
    }

    pub fn fail(&mut self, field: &'static str, reason: impl Into<String>) {
        self.errors.push(FieldError {
            field,
            reason: reason.into(),
        });
    }
}

fn looks_like_email(value: &str) -> bool {
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }

    match value.rsplit_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}
