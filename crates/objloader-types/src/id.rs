use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content-addressed identifier of a [`Base`](crate::Base).
///
/// The id is the hash computed by whoever produced the object. The loader
/// never recomputes it; it only relies on the guarantee that two objects
/// with the same id have byte-identical content, which makes every cache
/// entry valid forever.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaseId(String);

impl BaseId {
    /// Wrap an id string without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an id, rejecting empty or whitespace-bearing strings.
    pub fn parse(id: &str) -> Result<Self, TypeError> {
        if id.is_empty() {
            return Err(TypeError::InvalidId("empty".into()));
        }
        if id.chars().any(|c| c.is_whitespace()) {
            return Err(TypeError::InvalidId(format!("whitespace in {id:?}")));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short representation (first 8 characters) for logs.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for BaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BaseId({})", self.short())
    }
}

impl fmt::Display for BaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for BaseId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for BaseId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BaseId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for BaseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn parse_rejects_empty() {
        assert!(matches!(BaseId::parse(""), Err(TypeError::InvalidId(_))));
    }

    #[test]
    fn parse_rejects_whitespace() {
        assert!(BaseId::parse("abc def").is_err());
        assert!(BaseId::parse("abc\tdef").is_err());
    }

    #[test]
    fn short_is_at_most_8_chars() {
        let id = BaseId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        let tiny = BaseId::new("abc");
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn display_is_full_id() {
        let id = BaseId::new("deadbeefcafe");
        assert_eq!(format!("{id}"), "deadbeefcafe");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = BaseId::new("abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");
        let back: BaseId = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn hash_set_lookup_by_str() {
        let mut set = HashSet::new();
        set.insert(BaseId::new("a"));
        assert!(set.contains("a"));
    }
}
