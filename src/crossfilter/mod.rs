mod clause;
mod dimension;
mod state;

pub use clause::{FilterClause, Operator};
pub use dimension::{DimensionValue, FilterDimensionMap, Scalar, ToggleOutcome};
pub use state::{CrossfilterState, ToggleOptions};
