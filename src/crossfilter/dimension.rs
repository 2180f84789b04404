//! Filter dimension values and their toggle semantics.

use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single filterable value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
  Bool(bool),
  Int(i64),
  Text(String),
}

impl Scalar {
  /// Parse user input: integers and `true`/`false` keep their type,
  /// anything else is text.
  pub fn parse(input: &str) -> Self {
    if let Ok(n) = input.parse::<i64>() {
      return Scalar::Int(n);
    }
    match input {
      "true" => Scalar::Bool(true),
      "false" => Scalar::Bool(false),
      _ => Scalar::Text(input.to_string()),
    }
  }
}

impl fmt::Display for Scalar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Scalar::Bool(b) => write!(f, "{}", b),
      Scalar::Int(n) => write!(f, "{}", n),
      Scalar::Text(s) => f.write_str(s),
    }
  }
}

impl From<&str> for Scalar {
  fn from(s: &str) -> Self {
    Scalar::Text(s.to_string())
  }
}

impl From<String> for Scalar {
  fn from(s: String) -> Self {
    Scalar::Text(s)
  }
}

impl From<i64> for Scalar {
  fn from(n: i64) -> Self {
    Scalar::Int(n)
  }
}

impl From<bool> for Scalar {
  fn from(b: bool) -> Self {
    Scalar::Bool(b)
  }
}

/// The value held by an active dimension: one scalar, or a non-empty list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DimensionValue {
  One(Scalar),
  Many(Vec<Scalar>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireValue {
  One(Scalar),
  Many(Vec<Scalar>),
}

impl WireValue {
  fn into_value(self) -> Option<DimensionValue> {
    match self {
      WireValue::One(v) => Some(DimensionValue::One(v)),
      WireValue::Many(values) if values.is_empty() => None,
      WireValue::Many(values) => Some(DimensionValue::Many(values)),
    }
  }
}

impl<'de> Deserialize<'de> for DimensionValue {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    WireValue::deserialize(deserializer)?
      .into_value()
      .ok_or_else(|| de::Error::invalid_length(0, &"a non-empty list"))
  }
}

impl DimensionValue {
  pub fn contains(&self, value: &Scalar) -> bool {
    match self {
      DimensionValue::One(v) => v == value,
      DimensionValue::Many(values) => values.contains(value),
    }
  }

  pub fn values(&self) -> Vec<&Scalar> {
    match self {
      DimensionValue::One(v) => vec![v],
      DimensionValue::Many(values) => values.iter().collect(),
    }
  }
}

/// Whether a toggle left the value selected or deselected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
  Applied,
  Removed,
}

/// Dimension name -> `null` or an active value.
///
/// An inactive dimension is `None`; a list never persists empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FilterDimensionMap(BTreeMap<String, Option<DimensionValue>>);

// An empty list reads back as an inactive dimension.
impl<'de> Deserialize<'de> for FilterDimensionMap {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = BTreeMap::<String, Option<WireValue>>::deserialize(deserializer)?;
    Ok(Self(
      raw
        .into_iter()
        .map(|(name, value)| (name, value.and_then(WireValue::into_value)))
        .collect(),
    ))
  }
}

impl FilterDimensionMap {
  pub fn new() -> Self {
    Self::default()
  }

  /// A map with every named dimension present and inactive.
  pub fn with_dimensions<I, S>(dimensions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut map = Self::new();
    for d in dimensions {
      map.register(d);
    }
    map
  }

  /// Add `dimension` as inactive if it is not already known.
  pub fn register(&mut self, dimension: impl Into<String>) {
    self.0.entry(dimension.into()).or_insert(None);
  }

  pub fn get(&self, dimension: &str) -> Option<&DimensionValue> {
    self.0.get(dimension).and_then(Option::as_ref)
  }

  pub fn is_active(&self, dimension: &str, value: &Scalar) -> bool {
    self
      .get(dimension)
      .map(|v| v.contains(value))
      .unwrap_or(false)
  }

  /// Toggle `value` in `dimension`.
  ///
  /// Single-select: selecting the current value clears the dimension,
  /// anything else replaces it. Multi-select: the value is appended if absent
  /// and removed if present; an emptied list collapses to `None`.
  pub fn toggle(&mut self, dimension: &str, value: Scalar, multi_select: bool) -> ToggleOutcome {
    let slot = self.0.entry(dimension.to_string()).or_insert(None);

    if !multi_select {
      if matches!(slot, Some(DimensionValue::One(current)) if *current == value) {
        *slot = None;
        return ToggleOutcome::Removed;
      }
      *slot = Some(DimensionValue::One(value));
      return ToggleOutcome::Applied;
    }

    match slot.take() {
      None => {
        *slot = Some(DimensionValue::Many(vec![value]));
        ToggleOutcome::Applied
      }
      Some(DimensionValue::One(current)) if current == value => ToggleOutcome::Removed,
      Some(DimensionValue::One(current)) => {
        *slot = Some(DimensionValue::Many(vec![current, value]));
        ToggleOutcome::Applied
      }
      Some(DimensionValue::Many(mut values)) => {
        let outcome = if let Some(idx) = values.iter().position(|v| *v == value) {
          values.remove(idx);
          ToggleOutcome::Removed
        } else {
          values.push(value);
          ToggleOutcome::Applied
        };
        if !values.is_empty() {
          *slot = Some(DimensionValue::Many(values));
        }
        outcome
      }
    }
  }

  /// Deactivate one dimension. Returns true if it was active.
  pub fn clear(&mut self, dimension: &str) -> bool {
    match self.0.get_mut(dimension) {
      Some(slot) => slot.take().is_some(),
      None => false,
    }
  }

  /// Deactivate every dimension except `keep`.
  pub fn clear_except(&mut self, keep: &str) {
    for (name, slot) in self.0.iter_mut() {
      if name != keep {
        *slot = None;
      }
    }
  }

  /// Deactivate every dimension, keeping the names.
  pub fn clear_all(&mut self) {
    for slot in self.0.values_mut() {
      *slot = None;
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&DimensionValue>)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
  }

  /// Active dimensions only.
  pub fn active(&self) -> impl Iterator<Item = (&str, &DimensionValue)> {
    self
      .0
      .iter()
      .filter_map(|(k, v)| v.as_ref().map(|v| (k.as_str(), v)))
  }

  pub fn active_count(&self) -> usize {
    self.active().count()
  }

  pub fn has_active(&self) -> bool {
    self.active_count() > 0
  }
}
