//! Filtered-aggregate response parsing.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// One `{ dimensionValue, count }` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCount {
  pub dimension_value: Value,
  pub count: u64,
}

/// Result of a filtered-aggregate call: a total and named group arrays.
///
/// The response shape is owned by the aggregation service, so parsing never
/// fails; anything unrecognised is dropped and a non-object response becomes
/// an empty, zeroed aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilteredAggregate {
  pub total: u64,
  pub groups: BTreeMap<String, Vec<GroupCount>>,
}

impl FilteredAggregate {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn from_response(response: &Value) -> Self {
    let Some(object) = response.as_object() else {
      return Self::empty();
    };

    let total = object.get("total").and_then(as_count).unwrap_or(0);

    let mut groups = BTreeMap::new();
    for (name, field) in object {
      let Some(items) = field.as_array() else {
        continue;
      };
      let parsed: Vec<GroupCount> = items.iter().filter_map(parse_group).collect();
      // An empty array is kept; an array of something else is not a group
      if !parsed.is_empty() || items.is_empty() {
        groups.insert(name.clone(), parsed);
      }
    }

    Self { total, groups }
  }

  pub fn group(&self, name: &str) -> &[GroupCount] {
    self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn is_empty(&self) -> bool {
    self.total == 0 && self.groups.values().all(Vec::is_empty)
  }
}

fn as_count(value: &Value) -> Option<u64> {
  value
    .as_u64()
    .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn parse_group(item: &Value) -> Option<GroupCount> {
  let object = item.as_object()?;
  let dimension_value = object
    .get("dimensionValue")
    .or_else(|| object.get("value"))?
    .clone();
  let count = object.get("count").and_then(as_count)?;
  Some(GroupCount {
    dimension_value,
    count,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parses_total_and_groups() {
    let aggregate = FilteredAggregate::from_response(&json!({
      "total": 42,
      "byStatus": [
        {"dimensionValue": "Open", "count": 30},
        {"dimensionValue": "Closed", "count": 12},
      ],
      "byYear": [{"value": 2024, "count": 42}],
      "generatedAt": "2024-06-01",
    }));

    assert_eq!(aggregate.total, 42);
    assert_eq!(aggregate.group("byStatus").len(), 2);
    assert_eq!(aggregate.group("byStatus")[1].count, 12);
    assert_eq!(aggregate.group("byYear")[0].dimension_value, json!(2024));
    assert!(aggregate.group("generatedAt").is_empty());
  }

  #[test]
  fn test_non_object_is_empty() {
    assert!(FilteredAggregate::from_response(&json!([1, 2, 3])).is_empty());
    assert!(FilteredAggregate::from_response(&json!("oops")).is_empty());
    assert!(FilteredAggregate::from_response(&Value::Null).is_empty());
  }

  #[test]
  fn test_bad_items_are_skipped() {
    let aggregate = FilteredAggregate::from_response(&json!({
      "total": "many",
      "tags": [{"dimensionValue": "a"}, {"dimensionValue": "b", "count": 2}, 7],
      "names": ["x", "y"],
    }));

    assert_eq!(aggregate.total, 0);
    assert_eq!(
      aggregate.group("tags"),
      &[GroupCount {
        dimension_value: json!("b"),
        count: 2
      }]
    );
    assert!(!aggregate.groups.contains_key("names"));
  }

  #[test]
  fn test_serializes_camel_case() {
    let mut aggregate = FilteredAggregate::empty();
    aggregate.groups.insert(
      "byStatus".into(),
      vec![GroupCount {
        dimension_value: json!("Open"),
        count: 1,
      }],
    );
    assert_eq!(
      serde_json::to_value(&aggregate).unwrap()["groups"]["byStatus"][0],
      json!({"dimensionValue": "Open", "count": 1})
    );
  }
}
