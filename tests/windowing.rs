use approx::assert_abs_diff_eq;
use icu_bench::data::{SequenceDataset, Split, SplitTables, Splits, VarRoles};
use ndarray::{Array1, array};
use polars::prelude::*;

fn static_table() -> DataFrame {
    df!("stay_id" => [1i64, 2, 3], "age" => [50.0, 60.0, 70.0]).unwrap()
}

fn dynamic_table() -> DataFrame {
    df!(
        "stay_id" => [1i64, 1, 1, 2, 2, 3],
        "time" => [0i64, 1, 2, 0, 1, 0],
        "hr" => [80.0, 82.0, 85.0, 100.0, 98.0, 70.0]
    )
    .unwrap()
}

fn per_stay_outcome() -> DataFrame {
    df!("stay_id" => [1i64, 2, 3], "label" => [1.0, 0.0, 0.0]).unwrap()
}

fn per_timestep_outcome() -> DataFrame {
    df!(
        "stay_id" => [1i64, 1, 1, 2, 2, 3],
        "label" => [0.0, 0.0, 1.0, 0.0, 1.0, 0.0]
    )
    .unwrap()
}

fn dataset(outcome: DataFrame, use_static: bool) -> SequenceDataset {
    let splits = Splits::from([(
        Split::Train,
        SplitTables::new(static_table(), dynamic_table(), outcome),
    )]);
    SequenceDataset::new(&splits, Split::Train, &VarRoles::default(), use_static).unwrap()
}

#[test]
fn every_sample_is_padded_to_the_longest_stay() {
    let data = dataset(per_stay_outcome(), true);
    assert_eq!(data.len(), 3);
    assert_eq!(data.maxlen(), 3);
    assert_eq!(data.num_measurements(), 6);
    assert_eq!(data.feature_names(), ["hr", "age"]);

    for index in 0..data.len() {
        let sample = data.get(index).unwrap();
        assert_eq!(sample.data.dim(), (3, 2));
        assert_eq!(sample.labels.len(), 3);
        assert_eq!(sample.mask.len(), 3);
    }
    assert!(data.get(3).is_none());
}

#[test]
fn single_label_is_aligned_to_the_last_timestep() {
    let data = dataset(per_stay_outcome(), true);

    let sample = data.get(1).unwrap();
    // Padding keeps label 0; the mask excludes it.
    assert_eq!(sample.labels, array![-1.0f32, 0.0, 0.0]);
    assert_eq!(sample.mask, array![false, true, false]);
    assert_eq!(sample.data.row(0), array![100.0f32, 60.0]);
    assert_eq!(sample.data.row(1), array![98.0f32, 60.0]);
    assert_eq!(sample.data.row(2), Array1::<f32>::zeros(2));

    let full = data.get(0).unwrap();
    assert_eq!(full.labels, array![-1.0f32, -1.0, 1.0]);
    assert_eq!(full.mask, array![false, false, true]);

    let one_step = data.get(2).unwrap();
    assert_eq!(one_step.labels, array![0.0f32, 0.0, 0.0]);
    assert_eq!(one_step.mask, array![true, false, false]);
}

#[test]
fn per_timestep_labels_mask_only_the_padding() {
    let data = dataset(per_timestep_outcome(), false);
    assert_eq!(data.num_features(), 1);

    let sample = data.get(1).unwrap();
    assert_eq!(sample.labels, array![0.0f32, 1.0, 0.0]);
    assert_eq!(sample.mask, array![true, true, false]);

    let full = data.get(0).unwrap();
    assert_eq!(full.mask, array![true, true, true]);
}

#[test]
fn missing_labels_are_masked() {
    let outcome = df!(
        "stay_id" => [1i64, 1, 1, 2, 2, 3],
        "label" => [Some(0.0), None, Some(1.0), Some(0.0), Some(1.0), None]
    )
    .unwrap();
    let data = dataset(outcome, false);

    let sample = data.get(0).unwrap();
    assert_eq!(sample.labels, array![0.0f32, -1.0, 1.0]);
    assert_eq!(sample.mask, array![true, false, true]);

    let balance = data.get_balance();
    let counts: Vec<usize> = balance.iter().map(|class| class.count).collect();
    assert_eq!(counts, [2, 2]);
}

#[test]
fn binary_balance_is_inverse_frequency() {
    let data = dataset(per_stay_outcome(), true);
    let balance = data.get_balance();
    assert_eq!(balance.len(), 2);

    let (a, b) = (balance[0].count as f64, balance[1].count as f64);
    assert_eq!((balance[0].label, balance[1].label), (0.0, 1.0));
    assert_eq!((a, b), (2.0, 1.0));
    assert_abs_diff_eq!(balance[0].weight, (a + b) / a / 2.0);
    assert_abs_diff_eq!(balance[1].weight, (a + b) / b / 2.0);
}

#[test]
fn flat_matrix_follows_the_label_granularity() {
    let per_stay = dataset(per_stay_outcome(), true);
    let (features, labels) = per_stay.get_data_and_labels();
    assert_eq!(features.nrows(), 3);
    assert_eq!(labels.len(), 3);
    assert_eq!(features.row(0), array![85.0, 50.0]);
    assert_eq!(labels, array![1.0, 0.0, 0.0]);

    let per_step = dataset(per_timestep_outcome(), true);
    let (features, labels) = per_step.get_data_and_labels();
    assert_eq!(features.nrows(), 6);
    assert_eq!(labels.len(), 6);
}

/// Stays listed in a different order by each table. Measurements are `10 * stay + t`,
/// so the stay of a feature row can be read back from its value.
fn shuffled_splits(outcome: DataFrame) -> Splits {
    let static_df = df!("stay_id" => [3i64, 1, 2], "age" => [70.0, 50.0, 60.0]).unwrap();
    let dynamic_df = df!(
        "stay_id" => [2i64, 2, 3, 1, 1, 1],
        "time" => [0i64, 1, 0, 0, 1, 2],
        "hr" => [20.0, 21.0, 30.0, 10.0, 11.0, 12.0]
    )
    .unwrap();
    Splits::from([(
        Split::Train,
        SplitTables::new(static_df, dynamic_df, outcome),
    )])
}

fn shuffled_dataset(outcome: DataFrame) -> SequenceDataset {
    SequenceDataset::new(&shuffled_splits(outcome), Split::Train, &VarRoles::default(), false)
        .unwrap()
}

fn stay_of(value: f64) -> f64 {
    (value / 10.0).floor()
}

#[test]
fn per_stay_rows_keep_dynamic_order_and_their_own_label() {
    let outcome = df!("stay_id" => [1i64, 3, 2], "label" => [1.0, 3.0, 2.0]).unwrap();
    let data = shuffled_dataset(outcome);

    let (features, labels) = data.get_data_and_labels();
    assert_eq!(features.column(0), array![21.0, 30.0, 12.0]);
    assert_eq!(labels, array![2.0, 3.0, 1.0]);

    // Samples follow the static table.
    assert_eq!(data.get(0).unwrap().labels, array![3.0f32, 0.0, 0.0]);
    assert_eq!(data.get(1).unwrap().labels, array![-1.0f32, -1.0, 1.0]);
}

#[test]
fn per_timestep_labels_stay_on_their_feature_rows() {
    let outcome = df!(
        "stay_id" => [1i64, 1, 1, 3, 2, 2],
        "label" => [1.0, 1.0, 1.0, 3.0, 2.0, 2.0]
    )
    .unwrap();
    let data = shuffled_dataset(outcome);

    let (features, labels) = data.get_data_and_labels();
    assert_eq!(features.nrows(), 6);
    assert_eq!(labels.len(), 6);
    for (row, label) in features.column(0).iter().zip(labels.iter()) {
        assert_eq!(stay_of(*row), *label);
    }
}

#[test]
fn mixed_label_granularity_is_aligned_per_stay() {
    // Stay 1 has one label for three timesteps; stays 2 and 3 have one per timestep.
    let outcome = df!(
        "stay_id" => [3i64, 1, 2, 2],
        "label" => [3.0, 1.0, 2.0, 2.0]
    )
    .unwrap();
    let data = shuffled_dataset(outcome);

    let (features, labels) = data.get_data_and_labels();
    assert_eq!(features.nrows(), data.num_measurements());
    assert_eq!(labels.len(), data.num_measurements());
    for (row, label) in features.column(0).iter().zip(labels.iter()) {
        if label.is_nan() {
            assert_eq!(stay_of(*row), 1.0);
            assert!(*row < 12.0);
        } else {
            assert_eq!(stay_of(*row), *label);
        }
    }
    assert_eq!(labels[5], 1.0);
}
