//! Secret Redaction
//!
//! Credential-like fields are classified by name when a config schema is
//! defined. A field is secret when its name contains `token`, `password`,
//! `key` or `secret`; the value itself is never inspected.
//!
//! Two operations are offered:
//! - [`SecretRedactor::redact`] masks a single value before it is logged or
//!   embedded in a message, given the field it came from.
//! - [`SecretRedactor::scrub`] removes any known secret value from free text,
//!   for driver and HTTP error messages that may echo connection details.

use std::borrow::Cow;
use std::collections::BTreeSet;

use crate::config::{ConfigSchema, ResolvedConfig};

/// Replacement text for masked values
pub const MASK: &str = "********";

const SECRET_MARKERS: [&str; 4] = ["token", "password", "key", "secret"];

/// Whether a field name marks its value as a credential
#[must_use]
pub fn is_secret_name(field_name: &str) -> bool {
    let lowered = field_name.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Masks secret values before they reach a log sink or an error message
#[derive(Clone, Default)]
pub struct SecretRedactor {
    secret_fields: BTreeSet<String>,
    /// Known secret values, longest first so overlapping values mask fully
    values: Vec<String>,
}

impl SecretRedactor {
    /// Redactor for the secret fields declared by a schema
    #[must_use]
    pub fn from_schema(schema: &ConfigSchema) -> Self {
        Self {
            secret_fields: schema
                .fields()
                .iter()
                .filter(|field| field.secret)
                .map(|field| field.name.to_string())
                .collect(),
            values: Vec::new(),
        }
    }

    /// Redactor that also knows the resolved secret values, enabling [`scrub`](Self::scrub)
    #[must_use]
    pub fn for_config(config: &ResolvedConfig) -> Self {
        let mut redactor = Self::default();
        for (name, value) in config.secret_values() {
            redactor.secret_fields.insert(name.to_string());
            redactor.push_value(&value);
        }
        redactor
    }

    /// Register an additional secret value
    pub fn push_value(&mut self, value: &str) {
        if value.is_empty() || self.values.iter().any(|known| known == value) {
            return;
        }
        self.values.push(value.to_string());
        self.values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    /// Whether `field_name` is a secret field
    #[must_use]
    pub fn is_secret(&self, field_name: &str) -> bool {
        self.secret_fields.contains(field_name) || is_secret_name(field_name)
    }

    /// Mask `value` when it belongs to a secret field
    #[must_use]
    pub fn redact<'a>(&self, value: &'a str, field_name: &str) -> Cow<'a, str> {
        if self.is_secret(field_name) {
            Cow::Borrowed(MASK)
        } else {
            Cow::Borrowed(value)
        }
    }

    /// Replace every known secret value inside `text`
    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();
        for value in &self.values {
            if scrubbed.contains(value.as_str()) {
                scrubbed = scrubbed.replace(value.as_str(), MASK);
            }
        }
        scrubbed
    }
}

impl std::fmt::Debug for SecretRedactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRedactor")
            .field("secret_fields", &self.secret_fields)
            .field("values", &self.values.len())
            .finish()
    }
}
