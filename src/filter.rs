//! Simulations filter: conjunction of per-column predicates
//!
//! JSON forms accepted for each column:
//!
//! ```json
//! {
//!   "seed": 1,                      // equality
//!   "ca": [1.0, 1.1],               // membership
//!   "depolarization": {"ge": 2.0, "lt": 4.0, "ne": 3.0},
//!   "simulation_id": [{"ge": 0}, {"isin": [0, 1, 2]}]  // conjunction
//! }
//! ```

use crate::table::{column_names, filter_rows, scalar_values, Scalar};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Comparison operators of the map form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Comparison {
    /// Equal to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<Scalar>,
    /// Not equal to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ne: Option<Scalar>,
    /// Greater than
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Scalar>,
    /// Greater than or equal to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ge: Option<Scalar>,
    /// Less than
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Scalar>,
    /// Less than or equal to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub le: Option<Scalar>,
    /// Member of
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isin: Option<Vec<Scalar>>,
}

impl Comparison {
    fn matches(&self, value: &Scalar) -> bool {
        let cmp = |bound: &Option<Scalar>, ok: fn(Ordering) -> bool| {
            bound
                .as_ref()
                .map_or(true, |b| value.compare(b).is_some_and(ok))
        };
        cmp(&self.eq, Ordering::is_eq)
            && self.ne.as_ref().map_or(true, |b| !value.loose_eq(b))
            && cmp(&self.gt, Ordering::is_gt)
            && cmp(&self.ge, Ordering::is_ge)
            && cmp(&self.lt, Ordering::is_lt)
            && cmp(&self.le, Ordering::is_le)
            && self
                .isin
                .as_ref()
                .map_or(true, |set| set.iter().any(|b| value.loose_eq(b)))
    }
}

/// Constraint on a single column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    /// Equal to a value
    Eq(Scalar),
    /// Member of a list
    In(Vec<Scalar>),
    /// Operator map
    Ops(Box<Comparison>),
    /// All the predicates hold
    All(Vec<Predicate>),
}

impl Predicate {
    /// True if the value satisfies the predicate
    #[must_use]
    pub fn matches(&self, value: &Scalar) -> bool {
        match self {
            Self::Eq(v) => value.loose_eq(v),
            Self::In(set) => set.iter().any(|v| value.loose_eq(v)),
            Self::Ops(cmp) => cmp.matches(value),
            Self::All(preds) => preds.iter().all(|p| p.matches(value)),
        }
    }

    /// Conservative implication: true only if every value accepted by `self`
    /// is provably accepted by `other`
    #[must_use]
    pub fn implies(&self, other: &Self) -> bool {
        if self == other {
            return true;
        }
        if let Self::All(others) = other {
            return others.iter().all(|o| self.implies(o));
        }
        match self {
            Self::Eq(v) => other.matches(v),
            Self::In(set) => set.iter().all(|v| other.matches(v)),
            Self::All(preds) => preds.iter().any(|p| p.implies(other)),
            Self::Ops(cmp) => match &cmp.isin {
                Some(set) => set.iter().all(|v| !cmp.matches(v) || other.matches(v)),
                None => false,
            },
        }
    }

    fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All(mut a), Self::All(b)) => {
                a.extend(b);
                Self::All(a)
            }
            (Self::All(mut a), b) => {
                a.push(b);
                Self::All(a)
            }
            (a, Self::All(mut b)) => {
                b.insert(0, a);
                Self::All(b)
            }
            (a, b) if a == b => a,
            (a, b) => Self::All(vec![a, b]),
        }
    }
}

/// Conjunction of column predicates selecting simulations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimulationsFilter {
    predicates: BTreeMap<String, Predicate>,
}

impl SimulationsFilter {
    /// Filter accepting everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate on a column, combined with any existing one
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, predicate: Predicate) -> Self {
        let column = column.into();
        let combined = match self.predicates.remove(&column) {
            Some(existing) => existing.and(predicate),
            None => predicate,
        };
        self.predicates.insert(column, combined);
        self
    }

    /// Shorthand for an equality predicate
    #[must_use]
    pub fn eq(self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.with(column, Predicate::Eq(value.into()))
    }

    /// Shorthand for a membership predicate
    #[must_use]
    pub fn isin<S: Into<Scalar>>(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        self.with(
            column,
            Predicate::In(values.into_iter().map(Into::into).collect()),
        )
    }

    /// True if the filter has no predicates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Iterate over `(column, predicate)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Predicate)> {
        self.predicates.iter()
    }

    /// Conjunction of both filters
    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        other
            .predicates
            .iter()
            .fold(self.clone(), |acc, (k, p)| acc.with(k.clone(), p.clone()))
    }

    /// True if every row accepted by `self` is accepted by `other`
    ///
    /// Conservative: may answer false for filters that are in fact narrower.
    #[must_use]
    pub fn is_subfilter_of(&self, other: &Self) -> bool {
        other.predicates.iter().all(|(column, theirs)| {
            self.predicates
                .get(column)
                .is_some_and(|ours| ours.implies(theirs))
        })
    }

    /// Row mask of the rows accepted by the filter
    ///
    /// # Errors
    /// Returns a configuration error if a filtered column is not in the table
    pub fn mask(&self, batch: &RecordBatch) -> Result<Vec<bool>> {
        let mut mask = vec![true; batch.num_rows()];
        for (column, predicate) in &self.predicates {
            if batch.column_by_name(column).is_none() {
                return Err(Error::Configuration(format!(
                    "filter column {column:?} not in {:?}",
                    column_names(batch)
                )));
            }
            for (keep, value) in mask.iter_mut().zip(scalar_values(batch, column)?) {
                *keep = *keep && predicate.matches(&value);
            }
        }
        Ok(mask)
    }

    /// Keep the rows accepted by the filter
    ///
    /// # Errors
    /// Returns a configuration error if a filtered column is not in the table
    pub fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        if self.is_empty() {
            return Ok(batch.clone());
        }
        filter_rows(batch, self.mask(batch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{i64_values, TableBuilder};

    fn campaign() -> RecordBatch {
        TableBuilder::new()
            .int64("simulation_id", vec![0, 1, 2, 3])
            .int64("seed", vec![1, 1, 2, 2])
            .float64("ca", vec![1.0, 1.1, 1.0, 1.1])
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_forms() {
        let filter: SimulationsFilter = serde_json::from_value(serde_json::json!({
            "seed": 1,
            "ca": [1.0, 1.1],
            "simulation_id": {"ge": 1},
            "x": [{"ne": 2}, {"lt": 5}]
        }))
        .unwrap();
        let preds: BTreeMap<&str, &Predicate> =
            filter.iter().map(|(k, v)| (k.as_str(), v)).collect();
        assert!(matches!(preds["seed"], Predicate::Eq(Scalar::Int(1))));
        assert!(matches!(preds["ca"], Predicate::In(_)));
        assert!(matches!(preds["simulation_id"], Predicate::Ops(_)));
        assert!(matches!(preds["x"], Predicate::All(_)));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let result: std::result::Result<SimulationsFilter, _> =
            serde_json::from_str(r#"{"seed": {"between": [1, 2]}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_apply() {
        let filter = SimulationsFilter::new().eq("seed", 2).isin("ca", [1.1]);
        let filtered = filter.apply(&campaign()).unwrap();
        assert_eq!(i64_values(&filtered, "simulation_id").unwrap(), vec![3]);

        let ops: SimulationsFilter =
            serde_json::from_str(r#"{"simulation_id": {"gt": 0, "le": 2}}"#).unwrap();
        let filtered = ops.apply(&campaign()).unwrap();
        assert_eq!(i64_values(&filtered, "simulation_id").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_apply_unknown_column() {
        let filter = SimulationsFilter::new().eq("missing", 1);
        assert!(matches!(filter.apply(&campaign()), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_empty_filter_is_identity() {
        let batch = campaign();
        assert_eq!(SimulationsFilter::new().apply(&batch).unwrap(), batch);
    }

    #[test]
    fn test_subfilter() {
        let loose = SimulationsFilter::new().isin("seed", [1, 2]);
        let narrow = SimulationsFilter::new().eq("seed", 1).eq("ca", 1.0);
        assert!(narrow.is_subfilter_of(&loose));
        assert!(!loose.is_subfilter_of(&narrow));
        assert!(loose.is_subfilter_of(&SimulationsFilter::new()));
        assert!(!SimulationsFilter::new().is_subfilter_of(&loose));

        let range: SimulationsFilter = serde_json::from_str(r#"{"seed": {"ge": 1}}"#).unwrap();
        assert!(narrow.is_subfilter_of(&range));
        // ranges are not compared with each other
        let tighter: SimulationsFilter = serde_json::from_str(r#"{"seed": {"ge": 2}}"#).unwrap();
        assert!(!tighter.is_subfilter_of(&range));
        assert!(range.is_subfilter_of(&range));
    }

    #[test]
    fn test_and_combines_same_column() {
        let a = SimulationsFilter::new().isin("seed", [1, 2]);
        let b = SimulationsFilter::new().eq("seed", 2);
        let both = a.and(&b);
        assert!(both.is_subfilter_of(&a));
        assert!(both.is_subfilter_of(&b));
        let filtered = both.apply(&campaign()).unwrap();
        assert_eq!(i64_values(&filtered, "seed").unwrap(), vec![2, 2]);

        let json = serde_json::to_string(&both).unwrap();
        let parsed: SimulationsFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, both);
    }
}
