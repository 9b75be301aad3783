//! Insertion-order header sets.
//!
//! Headers keep the order they were added in, both for request parsing and
//! for response emission. Lookup is case-insensitive regardless of the case
//! policy used for storage.

use crate::config::HeaderCase;

/// An ordered multimap of header name → value.
#[derive(Debug, Clone)]
pub struct HeaderSet {
    case: HeaderCase,
    fields: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn new(case: HeaderCase) -> Self {
        HeaderSet {
            case,
            fields: Vec::new(),
        }
    }

    fn fold(&self, name: &str) -> String {
        match self.case {
            HeaderCase::Preserve => name.to_string(),
            HeaderCase::Lower => name.to_ascii_lowercase(),
            HeaderCase::Upper => name.to_ascii_uppercase(),
        }
    }

    /// Append a field, keeping any existing fields of the same name.
    pub fn add(&mut self, name: &str, value: &str) {
        self.fields
            .push((self.fold(name), value.trim().to_string()));
    }

    /// Replace the first field of this name, or append if absent.
    pub fn set(&mut self, name: &str, value: &str) {
        let folded = self.fold(name);
        if let Some(field) = self
            .fields
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&folded))
        {
            field.1 = value.trim().to_string();
        } else {
            self.fields.push((folded, value.trim().to_string()));
        }
    }

    /// First value under this name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append `extra` to the value of the most recently added field, joined
    /// with a single space. Used for folded continuation lines.
    pub fn extend_last(&mut self, extra: &str) {
        if let Some((_, value)) = self.fields.last_mut() {
            value.push(' ');
            value.push_str(extra.trim());
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse one `Name: value` line into the set. Returns false for a line
    /// without a colon.
    pub fn parse_add(&mut self, line: &str) -> bool {
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                self.add(name.trim(), value);
                true
            }
            _ => false,
        }
    }
}
