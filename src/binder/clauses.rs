use std::collections::BTreeMap;

use crate::crossfilter::{FilterClause, FilterDimensionMap};

/// Flatten the active dimensions into filter clauses.
///
/// `field_names` maps a dimension to the backend field it filters; a
/// dimension without a mapping filters the field of the same name. Inactive
/// dimensions contribute nothing.
pub fn to_clause_list(
  filters: &FilterDimensionMap,
  field_names: &BTreeMap<String, String>,
) -> Vec<FilterClause> {
  filters
    .active()
    .map(|(dimension, value)| {
      let field = field_names
        .get(dimension)
        .map(String::as_str)
        .unwrap_or(dimension);
      FilterClause::for_value(field, value)
    })
    .collect()
}
