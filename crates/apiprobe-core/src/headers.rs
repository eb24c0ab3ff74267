//! Ordered, multi-valued header representation used in payloads.

use http::HeaderMap;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Header names mapped to their ordered values.
///
/// Unlike [`HeaderMap`] this keeps values as plain strings so that redacted
/// copies can hold a mask token, and it serializes as a JSON object whose
/// keys keep their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<(String, Vec<String>)>);

impl HeaderList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Copy every header out of an [`HeaderMap`], keeping insertion order.
    ///
    /// Values that are not valid UTF-8 are converted lossily.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let entries = headers
            .keys()
            .map(|name| {
                let values = headers
                    .get_all(name)
                    .iter()
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                    .collect();
                (name.as_str().to_string(), values)
            })
            .collect();
        Self(entries)
    }

    /// Append a value, grouping it under an existing entry with the same
    /// (case-insensitive) name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self
            .0
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some((_, values)) => values.push(value.into()),
            None => self.0.push((name, vec![value.into()])),
        }
    }

    /// Values for a header, looked up case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// Iterate over `(name, values)` in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list has no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rebuild the list, letting `f` replace the values of each entry.
    pub(crate) fn map_values<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&str, &[String]) -> Vec<String>,
    {
        Self(
            self.0
                .iter()
                .map(|(name, values)| (name.clone(), f(name, values)))
                .collect(),
        )
    }
}

impl From<&HeaderMap> for HeaderList {
    fn from(headers: &HeaderMap) -> Self {
        Self::from_header_map(headers)
    }
}

impl Serialize for HeaderList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, values) in &self.0 {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderListVisitor;

        impl<'de> Visitor<'de> for HeaderListVisitor {
            type Value = HeaderList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of header names to lists of values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
                    entries.push((name, values));
                }
                Ok(HeaderList(entries))
            }
        }

        deserializer.deserialize_map(HeaderListVisitor)
    }
}
