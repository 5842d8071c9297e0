//! # Windowed Sequence Dataset
//!
//! Converts the grouped, variable-length tables of one split into fixed-length samples
//! for sequence models, and into flat matrices for models that consume one table.
//!
//! All indexing work happens once at construction:
//!
//! 1. Each stay is mapped to the contiguous row range it occupies in the dynamic and
//!    outcome tables, so a window is a plain slice of a precomputed matrix.
//! 2. The sequence column is dropped. Order within a stay is the table order.
//! 3. With `use_static`, static attributes are repeated onto every timestep of a stay.
//!
//! A sample is `(data [maxlen, F], labels [maxlen], mask [maxlen])`, where `maxlen` is
//! the longest stay of the split. Stays with a single label have it aligned to their
//! last timestep; earlier timesteps are unlabeled. Unlabeled timesteps carry label `-1`,
//! padding keeps label `0`, and both are masked out.

use crate::config::ConfigStore;
use crate::data::tables::{
    DataError, Split, Splits, VarRoles, feature_columns, float_column, group_keys,
};
use ahash::AHashMap;
use ndarray::{Array1, Array2, Axis, s};
use std::ops::Range;

/// One padded sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Shape `[maxlen, num_features]`. Padding rows are zero.
    pub data: Array2<f32>,
    /// Shape `[maxlen]`. Unlabeled and padding positions are `-1` and `0` respectively
    /// before masking; both are masked out.
    pub labels: Array1<f32>,
    /// Shape `[maxlen]`. `true` marks a real, labeled timestep.
    pub mask: Array1<bool>,
}

/// Inverse-frequency weight of one label value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassWeight {
    pub label: f64,
    pub count: usize,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct SequenceDataset {
    split: Split,
    /// Stay identifiers in static-table order; position `i` is sample `i`.
    stay_ids: Vec<String>,
    /// Stays in order of first appearance in the dynamic table.
    dynamic_order: Vec<String>,
    dynamic_rows: AHashMap<String, Range<usize>>,
    outcome_rows: AHashMap<String, Range<usize>>,
    feature_names: Vec<String>,
    /// Dynamic measurements, joined with static attributes when requested.
    /// Shape: [num_measurements, num_features].
    features: Array2<f64>,
    labels: Array1<f64>,
    num_stays: usize,
    num_measurements: usize,
    maxlen: usize,
}

impl SequenceDataset {
    pub fn new(
        data: &Splits,
        split: Split,
        vars: &VarRoles,
        use_static: bool,
    ) -> Result<Self, DataError> {
        let tables = data.get(&split).ok_or(DataError::MissingSplit(split))?;
        let static_df = &tables.static_df;
        let dynamic_df = &tables.dynamic_df;
        let outcome_df = &tables.outcome_df;

        // --- Stay index ---
        let stay_ids = group_keys(static_df, &vars.group)?;
        let mut static_position: AHashMap<String, usize> = AHashMap::with_capacity(stay_ids.len());
        for (position, stay) in stay_ids.iter().enumerate() {
            if static_position.insert(stay.clone(), position).is_some() {
                return Err(DataError::DuplicateStay(stay.clone()));
            }
        }

        let dynamic_keys = group_keys(dynamic_df, &vars.group)?;
        let (dynamic_order, dynamic_rows) = contiguous_ranges(&dynamic_keys, "dynamic")?;
        let outcome_keys = group_keys(outcome_df, &vars.group)?;
        let (_, outcome_rows) = contiguous_ranges(&outcome_keys, "outcome")?;

        for stay in &stay_ids {
            if !dynamic_rows.contains_key(stay) {
                return Err(DataError::MissingDynamicRows(stay.clone()));
            }
        }
        if dynamic_order.len() != stay_ids.len() {
            return Err(DataError::StayCountMismatch {
                dynamic: dynamic_order.len(),
                stays: stay_ids.len(),
            });
        }

        // --- Feature matrix ---
        if dynamic_df.column(&vars.sequence).is_err() {
            return Err(DataError::ColumnNotFound(vars.sequence.clone()));
        }
        let dynamic_columns =
            feature_columns(dynamic_df, &[vars.group.as_str(), vars.sequence.as_str()]);
        let static_columns = if use_static {
            feature_columns(static_df, &[vars.group.as_str()])
        } else {
            Vec::new()
        };

        let num_measurements = dynamic_df.height();
        let num_features = dynamic_columns.len() + static_columns.len();
        let mut features = Array2::<f64>::zeros((num_measurements, num_features));
        for (j, name) in dynamic_columns.iter().enumerate() {
            let values = float_column(dynamic_df, name)?;
            features.column_mut(j).assign(&Array1::from_vec(values));
        }
        if !static_columns.is_empty() {
            // Left join: every dynamic row takes the attributes of its stay's static row.
            let static_row_of: Vec<usize> = dynamic_keys
                .iter()
                .map(|key| static_position[key])
                .collect();
            for (k, name) in static_columns.iter().enumerate() {
                let values = float_column(static_df, name)?;
                let mut column = features.column_mut(dynamic_columns.len() + k);
                for (row, &static_row) in static_row_of.iter().enumerate() {
                    column[row] = values[static_row];
                }
            }
        }

        // --- Labels ---
        let labels = Array1::from_vec(float_column(outcome_df, &vars.label)?);
        for stay in &stay_ids {
            let timesteps = dynamic_rows[stay].len();
            let num_labels = outcome_rows.get(stay).map_or(0, |rows| rows.len());
            if num_labels != 1 && num_labels != timesteps {
                return Err(DataError::LabelCountMismatch {
                    group: stay.clone(),
                    labels: num_labels,
                    timesteps,
                });
            }
        }

        let maxlen = dynamic_rows.values().map(|rows| rows.len()).max().unwrap_or(0);
        let mut feature_names = dynamic_columns;
        feature_names.extend(static_columns);

        log::info!(
            "Built {} dataset: {} stays, {} measurements, {} features, maxlen {}.",
            split,
            stay_ids.len(),
            num_measurements,
            num_features,
            maxlen
        );

        Ok(Self {
            split,
            num_stays: stay_ids.len(),
            stay_ids,
            dynamic_order,
            dynamic_rows,
            outcome_rows,
            feature_names,
            features,
            labels,
            num_measurements,
            maxlen,
        })
    }

    /// Builds the dataset with roles and `Dataset.use_static` (default `true`) taken
    /// from the configuration.
    pub fn from_config(
        data: &Splits,
        split: Split,
        config: &ConfigStore,
    ) -> Result<Self, DataError> {
        let vars = VarRoles::from_config(config)?;
        let use_static = config.get_or("Dataset.use_static", true)?;
        Self::new(data, split, &vars, use_static)
    }

    /// Number of stays in the split.
    pub fn len(&self) -> usize {
        self.num_stays
    }

    pub fn is_empty(&self) -> bool {
        self.num_stays == 0
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    pub fn num_measurements(&self) -> usize {
        self.num_measurements
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn stay_ids(&self) -> &[String] {
        &self.stay_ids
    }

    /// The padded sample of the stay at position `index` of the static table.
    pub fn get(&self, index: usize) -> Option<Sample> {
        let stay = self.stay_ids.get(index)?;
        let rows = self.dynamic_rows.get(stay)?.clone();
        let timesteps = rows.len();

        let mut labels = Array1::<f64>::zeros(self.maxlen);
        labels
            .slice_mut(s![..timesteps])
            .assign(&self.timestep_labels(stay)?);

        let mut data = Array2::<f32>::zeros((self.maxlen, self.num_features()));
        data.slice_mut(s![..timesteps, ..])
            .assign(&self.features.slice(s![rows, ..]).mapv(|v| v as f32));

        let mut mask = Array1::from_elem(self.maxlen, false);
        mask.slice_mut(s![..timesteps]).fill(true);

        for (label, valid) in labels.iter_mut().zip(mask.iter_mut()) {
            if label.is_nan() {
                *label = -1.0;
                *valid = false;
            }
        }

        Some(Sample {
            data,
            labels: labels.mapv(|v| v as f32),
            mask,
        })
    }

    /// Per-class weights `(total / count) / num_classes`, ordered by label value.
    /// Unlabeled (NaN) outcomes are not counted.
    pub fn get_balance(&self) -> Vec<ClassWeight> {
        let mut counts: Vec<(f64, usize)> = Vec::new();
        for &label in self.labels.iter().filter(|v| !v.is_nan()) {
            match counts.iter_mut().find(|(value, _)| *value == label) {
                Some((_, count)) => *count += 1,
                None => counts.push((label, 1)),
            }
        }
        counts.sort_by(|a, b| a.0.total_cmp(&b.0));

        let total: usize = counts.iter().map(|(_, count)| count).sum();
        let num_classes = counts.len() as f64;
        counts
            .into_iter()
            .map(|(label, count)| ClassWeight {
                label,
                count,
                weight: (total as f64 / count as f64) / num_classes,
            })
            .collect()
    }

    /// The unwindowed feature matrix and label vector.
    ///
    /// With one label per stay, the features collapse to each stay's last timestep, in
    /// the order stays appear in the dynamic table. Otherwise every timestep is returned
    /// with its label in the same row, whatever order the outcome table lists stays in;
    /// stays with a single label get it on their last timestep and NaN before.
    pub fn get_data_and_labels(&self) -> (Array2<f64>, Array1<f64>) {
        if self.labels.len() == self.num_stays {
            let last_rows: Vec<usize> = self
                .dynamic_order
                .iter()
                .map(|stay| self.dynamic_rows[stay].end - 1)
                .collect();
            let label_rows: Vec<usize> = self
                .dynamic_order
                .iter()
                .map(|stay| self.outcome_rows[stay].start)
                .collect();
            (
                self.features.select(Axis(0), &last_rows),
                self.labels.select(Axis(0), &label_rows),
            )
        } else {
            let mut labels = Array1::<f64>::from_elem(self.num_measurements, f64::NAN);
            for stay in &self.dynamic_order {
                let rows = self.dynamic_rows[stay].clone();
                if let Some(aligned) = self.timestep_labels(stay) {
                    labels.slice_mut(s![rows]).assign(&aligned);
                }
            }
            (self.features.clone(), labels)
        }
    }

    /// One label per timestep of `stay`. A single stay-level label belongs to the last
    /// timestep; earlier timesteps are NaN.
    fn timestep_labels(&self, stay: &str) -> Option<Array1<f64>> {
        let timesteps = self.dynamic_rows.get(stay)?.len();
        let outcome = self.labels.slice(s![self.outcome_rows.get(stay)?.clone()]);
        if outcome.len() == timesteps {
            return Some(outcome.to_owned());
        }
        let mut aligned = Array1::from_elem(timesteps, f64::NAN);
        aligned[timesteps - 1] = outcome[0];
        Some(aligned)
    }
}

/// Maps each key to the contiguous range of rows it occupies, and lists keys in order of
/// first appearance.
fn contiguous_ranges(
    keys: &[String],
    table: &'static str,
) -> Result<(Vec<String>, AHashMap<String, Range<usize>>), DataError> {
    let mut order = Vec::new();
    let mut ranges: AHashMap<String, Range<usize>> = AHashMap::new();
    let mut start = 0;
    for end in 1..=keys.len() {
        if end < keys.len() && keys[end] == keys[start] {
            continue;
        }
        let key = &keys[start];
        if ranges.insert(key.clone(), start..end).is_some() {
            return Err(DataError::NonContiguousGroup {
                table,
                group: key.clone(),
            });
        }
        order.push(key.clone());
        start = end;
    }
    Ok((order, ranges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tables::SplitTables;
    use polars::prelude::*;
    use std::collections::HashMap;

    fn splits_with(outcome: DataFrame) -> Splits {
        let static_df = df!("stay_id" => [1i64, 2], "age" => [50.0, 60.0]).unwrap();
        let dynamic_df = df!(
            "stay_id" => [1i64, 1, 1, 2],
            "time" => [0i64, 1, 2, 0],
            "hr" => [80.0, 81.0, 82.0, 90.0]
        )
        .unwrap();
        HashMap::from([(Split::Train, SplitTables::new(static_df, dynamic_df, outcome))])
    }

    #[test]
    fn contiguous_ranges_follow_first_appearance() {
        let keys: Vec<String> = ["b", "b", "a", "c", "c", "c"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        let (order, ranges) = contiguous_ranges(&keys, "dynamic").unwrap();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert_eq!(ranges["b"], 0..2);
        assert_eq!(ranges["a"], 2..3);
        assert_eq!(ranges["c"], 3..6);
    }

    #[test]
    fn split_groups_are_rejected() {
        let keys: Vec<String> = ["a", "b", "a"].iter().map(|k| k.to_string()).collect();
        assert!(matches!(
            contiguous_ranges(&keys, "dynamic"),
            Err(DataError::NonContiguousGroup { .. })
        ));
    }

    #[test]
    fn static_attributes_are_repeated_per_timestep() {
        let outcome = df!("stay_id" => [1i64, 2], "label" => [0.0, 1.0]).unwrap();
        let dataset =
            SequenceDataset::new(&splits_with(outcome), Split::Train, &VarRoles::default(), true)
                .unwrap();
        assert_eq!(dataset.feature_names(), &["hr".to_string(), "age".to_string()]);
        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.data.column(1).to_vec(), vec![50.0, 50.0, 50.0]);
    }

    #[test]
    fn label_count_must_match_timesteps() {
        let outcome = df!("stay_id" => [1i64, 1, 2], "label" => [0.0, 1.0, 1.0]).unwrap();
        let err =
            SequenceDataset::new(&splits_with(outcome), Split::Train, &VarRoles::default(), false)
                .unwrap_err();
        assert!(matches!(
            err,
            DataError::LabelCountMismatch {
                labels: 2,
                timesteps: 3,
                ..
            }
        ));
    }

    #[test]
    fn out_of_range_index_yields_none() {
        let outcome = df!("stay_id" => [1i64, 2], "label" => [0.0, 1.0]).unwrap();
        let dataset =
            SequenceDataset::new(&splits_with(outcome), Split::Train, &VarRoles::default(), false)
                .unwrap();
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn missing_split_is_reported() {
        let outcome = df!("stay_id" => [1i64, 2], "label" => [0.0, 1.0]).unwrap();
        let err =
            SequenceDataset::new(&splits_with(outcome), Split::Test, &VarRoles::default(), false)
                .unwrap_err();
        assert!(matches!(err, DataError::MissingSplit(Split::Test)));
    }
}
