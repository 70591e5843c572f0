//! Device search terms
//!
//! A [`DeviceSearchTerm`] selects which enumerated port a slot should open.
//! Terms are immutable once built; a slot swaps in a whole new term rather
//! than editing the current one.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::port::PortDescriptor;

/// Descriptor field a term is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchField {
    Name,
    Manufacturer,
    Id,
    Version,
}

impl SearchField {
    fn value(self, port: &PortDescriptor) -> &str {
        match self {
            SearchField::Name => &port.name,
            SearchField::Manufacturer => &port.manufacturer,
            SearchField::Id => &port.id,
            SearchField::Version => &port.version,
        }
    }
}

/// How to find a port among the enumerated candidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSearchTerm {
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_fields")]
    pub fields: Vec<SearchField>,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
    #[serde(default = "default_true")]
    pub substring: bool,
    #[serde(default)]
    pub fallback_to_any: bool,
}

fn default_fields() -> Vec<SearchField> {
    vec![SearchField::Name]
}

fn default_true() -> bool {
    true
}

impl Default for DeviceSearchTerm {
    fn default() -> Self {
        Self::new("")
    }
}

impl DeviceSearchTerm {
    /// Case-insensitive substring match on the port name, no fallback
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fields: default_fields(),
            case_insensitive: true,
            substring: true,
            fallback_to_any: false,
        }
    }

    /// Matches the first enumerated port
    pub fn any() -> Self {
        Self::new("").fallback_to_any(true)
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = SearchField>) -> Self {
        self.fields = fields.into_iter().collect();
        self
    }

    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    pub fn substring(mut self, yes: bool) -> Self {
        self.substring = yes;
        self
    }

    pub fn fallback_to_any(mut self, yes: bool) -> Self {
        self.fallback_to_any = yes;
        self
    }

    /// Whether `candidate` satisfies this term on any selected field.
    ///
    /// An empty term matches everything when fallback is allowed. With
    /// fallback disabled it can never match, which is reported as a warning.
    pub fn matches(&self, candidate: &PortDescriptor) -> bool {
        if self.text.is_empty() {
            if !self.fallback_to_any {
                warn!("Empty device search term without fallback never matches a port");
            }
            return self.fallback_to_any;
        }

        self.fields
            .iter()
            .any(|field| self.compare(field.value(candidate)))
    }

    fn compare(&self, value: &str) -> bool {
        match (self.case_insensitive, self.substring) {
            (true, true) => value.to_lowercase().contains(&self.text.to_lowercase()),
            (true, false) => value.to_lowercase() == self.text.to_lowercase(),
            (false, true) => value.contains(&self.text),
            (false, false) => value == self.text,
        }
    }

    /// Pick the port to open from `candidates`.
    ///
    /// First match wins. When nothing matches and fallback is set, the first
    /// enumerated candidate is returned with no further ranking.
    pub fn select<'a>(&self, candidates: &'a [PortDescriptor]) -> Option<&'a PortDescriptor> {
        if self.text.is_empty() && !self.fallback_to_any {
            warn!("Empty device search term without fallback never matches a port");
            return None;
        }

        if let Some(found) = candidates.iter().find(|c| self.matches(c)) {
            debug!("Port '{}' matches search term '{}'", found.name, self.text);
            return Some(found);
        }

        if self.fallback_to_any {
            if let Some(first) = candidates.first() {
                debug!("No port matches '{}', falling back to '{}'", self.text, first.name);
                return Some(first);
            }
        }

        None
    }
}

impl fmt::Display for DeviceSearchTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            f.write_str("<any>")
        } else {
            f.write_str(&self.text)
        }
    }
}
