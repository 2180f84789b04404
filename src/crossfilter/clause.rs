use serde::{Deserialize, Serialize};

use super::dimension::DimensionValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
  Eq,
  In,
}

/// One predicate sent to the filtered-aggregate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterClause {
  pub field: String,
  pub operator: Operator,
  pub value: DimensionValue,
}

impl FilterClause {
  /// `eq` for a scalar, `in` for a list.
  pub fn for_value(field: impl Into<String>, value: &DimensionValue) -> Self {
    let operator = match value {
      DimensionValue::One(_) => Operator::Eq,
      DimensionValue::Many(_) => Operator::In,
    };
    Self {
      field: field.into(),
      operator,
      value: value.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crossfilter::Scalar;
  use serde_json::json;

  #[test]
  fn test_wire_shape() {
    let eq = FilterClause::for_value("status", &DimensionValue::One(Scalar::from("Open")));
    let within = FilterClause::for_value(
      "year",
      &DimensionValue::Many(vec![Scalar::Int(2023), Scalar::Int(2024)]),
    );

    assert_eq!(
      serde_json::to_value([eq, within]).unwrap(),
      json!([
        {"field": "status", "operator": "eq", "value": "Open"},
        {"field": "year", "operator": "in", "value": [2023, 2024]},
      ])
    );
  }
}
