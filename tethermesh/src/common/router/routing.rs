// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wildcard routing rules mapping destination addresses to next-hop peers
//!
//! Rules are kept in declaration order and the first match wins. Patterns are
//! anchored at both ends, `*` matches any run of characters (including none),
//! and everything else is compared literally, ignoring ASCII case.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Target names which always mean "execute on this node"
pub const LOCAL_TARGETS: &[&str] = &["local", "localhost"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
  source: String,
  /// Lowercased literal runs between `*` characters; a single entry means no wildcard
  segments: Vec<String>,
}

impl WildcardPattern {
  pub fn new<S: Into<String>>(source: S) -> Self {
    let source = source.into();
    let segments = source
      .split('*')
      .map(|segment| segment.to_ascii_lowercase())
      .collect();
    Self { source, segments }
  }

  pub fn as_str(&self) -> &str {
    &self.source
  }

  pub fn matches(&self, input: &str) -> bool {
    let input = input.to_ascii_lowercase();
    let (first, rest) = match self.segments.split_first() {
      Some(parts) => parts,
      None => return input.is_empty(),
    };
    let (last, middle) = match rest.split_last() {
      Some(parts) => parts,
      None => return input == *first,
    };
    if input.len() < first.len() + last.len()
      || !input.starts_with(first.as_str())
      || !input.ends_with(last.as_str())
    {
      return false;
    }
    // Leftmost placement of each middle run leaves the most room for the rest
    let mut remaining = &input[first.len()..input.len() - last.len()];
    for segment in middle {
      match remaining.find(segment.as_str()) {
        Some(offset) => remaining = &remaining[offset + segment.len()..],
        None => return false,
      }
    }
    true
  }
}

impl fmt::Display for WildcardPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
  pub pattern: WildcardPattern,
  pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
  rules: Vec<RoutingRule>,
}

impl RoutingTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push<P: Into<String>, T: Into<String>>(&mut self, pattern: P, target: T) {
    self.rules.push(RoutingRule {
      pattern: WildcardPattern::new(pattern),
      target: target.into(),
    });
  }

  pub fn with_rule<P: Into<String>, T: Into<String>>(mut self, pattern: P, target: T) -> Self {
    self.push(pattern, target);
    self
  }

  pub fn rules(&self) -> &[RoutingRule] {
    &self.rules
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Target of the first rule matching `address`, if any
  pub fn resolve(&self, address: &str) -> Option<&str> {
    self
      .rules
      .iter()
      .find(|rule| rule.pattern.matches(address))
      .map(|rule| rule.target.as_str())
  }
}

impl<P: Into<String>, T: Into<String>> FromIterator<(P, T)> for RoutingTable {
  fn from_iter<I: IntoIterator<Item = (P, T)>>(iter: I) -> Self {
    let mut table = RoutingTable::new();
    for (pattern, target) in iter {
      table.push(pattern, target);
    }
    table
  }
}

/// Whether `target` names local execution rather than a peer
pub fn is_local_target(target: &str) -> bool {
  LOCAL_TARGETS
    .iter()
    .any(|local| target.eq_ignore_ascii_case(local))
}

impl Serialize for RoutingTable {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.rules.len()))?;
    for rule in &self.rules {
      map.serialize_entry(rule.pattern.as_str(), &rule.target)?;
    }
    map.end()
  }
}

struct RoutingTableVisitor;

impl<'de> Visitor<'de> for RoutingTableVisitor {
  type Value = RoutingTable;

  fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    formatter.write_str("a map of wildcard patterns to target client ids")
  }

  fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
    let mut table = RoutingTable::new();
    while let Some((pattern, target)) = access.next_entry::<String, String>()? {
      table.push(pattern, target);
    }
    Ok(table)
  }
}

impl<'de> Deserialize<'de> for RoutingTable {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    deserializer.deserialize_map(RoutingTableVisitor)
  }
}
