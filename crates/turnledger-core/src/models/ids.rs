//! Identifier models
//!
//! Identifiers in the datastore arrive either as plain text or as 12-byte
//! structured ids (`{"$oid": "<24 hex>"}` in extended JSON). [`IdValue`]
//! keeps both forms explicit; the string newtypes below hold the canonical
//! text form used throughout reports.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

/// Length in bytes of a structured datastore id
pub const OBJECT_ID_LEN: usize = 12;

/// An identifier as stored: plain text or structured binary id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdValue {
    Text(String),
    ObjectId([u8; OBJECT_ID_LEN]),
}

impl IdValue {
    /// Parse a 24-char hex string into structured id bytes
    pub fn parse_object_id(s: &str) -> Option<[u8; OBJECT_ID_LEN]> {
        if s.len() != OBJECT_ID_LEN * 2 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok()
    }

    /// Read an identifier from a raw document value
    ///
    /// Accepts strings, `{"$oid": ".."}` objects and integers. Empty strings
    /// and every other shape resolve to `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(IdValue::Text(trimmed.to_string()))
                }
            }
            Value::Object(map) => map
                .get("$oid")
                .and_then(Value::as_str)
                .and_then(Self::parse_object_id)
                .map(IdValue::ObjectId),
            Value::Number(n) => Some(IdValue::Text(n.to_string())),
            _ => None,
        }
    }

    /// Expand a text identifier into every stored form it may take
    ///
    /// A 24-hex string is queried both as text and as a structured id.
    pub fn expand(text: &str) -> Vec<IdValue> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let mut forms = vec![IdValue::Text(trimmed.to_string())];
        if let Some(bytes) = Self::parse_object_id(trimmed) {
            forms.push(IdValue::ObjectId(bytes));
        }
        forms
    }

    /// Expand many identifiers, keeping first-seen order without duplicates
    pub fn expand_all<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<IdValue> {
        let mut out: Vec<IdValue> = Vec::new();
        for text in texts {
            for form in Self::expand(text) {
                if !out.contains(&form) {
                    out.push(form);
                }
            }
        }
        out
    }

    /// Raw document representation of this identifier
    pub fn to_value(&self) -> Value {
        match self {
            IdValue::Text(s) => Value::String(s.clone()),
            IdValue::ObjectId(bytes) => json!({ "$oid": hex::encode(bytes) }),
        }
    }

    /// Canonical text form: structured ids become lowercase hex
    pub fn canonical(&self) -> String {
        match self {
            IdValue::Text(s) => {
                if Self::parse_object_id(s).is_some() {
                    s.to_ascii_lowercase()
                } else {
                    s.clone()
                }
            }
            IdValue::ObjectId(bytes) => hex::encode(bytes),
        }
    }

    /// True when both values denote the same identifier in any form
    pub fn same_as(&self, other: &IdValue) -> bool {
        self.canonical() == other.canonical()
    }

    /// Membership check across representations
    pub fn matches_any(&self, candidates: &[IdValue]) -> bool {
        candidates.iter().any(|c| self.same_as(c))
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            /// Every stored form this identifier may take
            pub fn forms(&self) -> Vec<IdValue> {
                IdValue::expand(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<&IdValue> for $name {
            fn from(id: &IdValue) -> Self {
                Self(id.canonical())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

string_id!(
    /// Customer identifier (canonical text form)
    CustomerId
);
string_id!(
    /// Channel identifier (canonical text form)
    ChannelId
);
string_id!(
    /// Session identifier (canonical text form)
    SessionId
);
