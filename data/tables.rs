//! # Split Tables and Variable Roles
//!
//! The harness consumes three tables per split:
//!
//! - `STATIC`: one row per stay with fixed attributes (age, sex, admission type...).
//! - `DYNAMIC`: one row per stay and timestep with the measurements.
//! - `OUTCOME`: one label per stay, or one label per stay and timestep.
//!
//! All three carry the group column named by [`VarRoles::group`]; the dynamic table
//! also carries the sequence column named by [`VarRoles::sequence`]. Rows of one stay
//! are expected to be contiguous, which is how the upstream extraction writes them.

use crate::config::{ConfigError, ConfigStore};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const STATIC_FILE: &str = "sta.csv";
pub const DYNAMIC_FILE: &str = "dyn.csv";
pub const OUTCOME_FILE: &str = "outc.csv";

/// A comprehensive error type for table loading and dataset construction.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error while reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error(
        "The required column '{0}' was not found in the input table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the group column '{0}'. Every row must belong to a stay.")]
    MissingGroupKey(String),
    #[error("Split '{0}' is not present in the provided data.")]
    MissingSplit(Split),
    #[error("Unknown split '{0}'. Use train, val, or test.")]
    UnknownSplit(String),
    #[error("Stay '{0}' appears more than once in the static table.")]
    DuplicateStay(String),
    #[error(
        "Rows of stay '{group}' are not contiguous in the {table} table. Sort the table by stay before loading."
    )]
    NonContiguousGroup { table: &'static str, group: String },
    #[error("Stay '{0}' is listed in the static table but has no dynamic rows.")]
    MissingDynamicRows(String),
    #[error(
        "The dynamic table holds {dynamic} stays but the static table holds {stays}. Every stay needs exactly one static row."
    )]
    StayCountMismatch { dynamic: usize, stays: usize },
    #[error(
        "Stay '{group}' has {labels} labels but {timesteps} timesteps; expected 1 or {timesteps}."
    )]
    LabelCountMismatch {
        group: String,
        labels: usize,
        timesteps: usize,
    },
}

/// Data split name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "val" | "validation" => Ok(Self::Val),
            "test" => Ok(Self::Test),
            _ => Err(DataError::UnknownSplit(s.to_string())),
        }
    }
}

/// Names of the columns with a structural role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarRoles {
    /// Stay identifier shared by all three tables.
    pub group: String,
    /// Timestep column of the dynamic table, dropped before windowing.
    pub sequence: String,
    /// Label column of the outcome table.
    #[serde(default = "default_label")]
    pub label: String,
}

fn default_label() -> String {
    "label".to_string()
}

impl Default for VarRoles {
    fn default() -> Self {
        Self {
            group: "stay_id".to_string(),
            sequence: "time".to_string(),
            label: default_label(),
        }
    }
}

impl VarRoles {
    /// Reads `Dataset.vars.GROUP`, `Dataset.vars.SEQUENCE` and `Dataset.vars.LABEL`,
    /// falling back to the defaults for missing entries.
    pub fn from_config(config: &ConfigStore) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            group: config.get_or("Dataset.vars.GROUP", defaults.group)?,
            sequence: config.get_or("Dataset.vars.SEQUENCE", defaults.sequence)?,
            label: config.get_or("Dataset.vars.LABEL", defaults.label)?,
        })
    }
}

/// The static, dynamic and outcome tables of one split.
#[derive(Debug, Clone)]
pub struct SplitTables {
    pub static_df: DataFrame,
    pub dynamic_df: DataFrame,
    pub outcome_df: DataFrame,
}

/// Tables keyed by split.
pub type Splits = HashMap<Split, SplitTables>;

impl SplitTables {
    pub fn new(static_df: DataFrame, dynamic_df: DataFrame, outcome_df: DataFrame) -> Self {
        Self {
            static_df,
            dynamic_df,
            outcome_df,
        }
    }

    /// Stay identifiers in static-table order.
    pub fn stay_ids(&self, vars: &VarRoles) -> Result<Vec<String>, DataError> {
        group_keys(&self.static_df, &vars.group)
    }

    /// Restricts all three tables to the given stays, keeping the original row order.
    pub fn select_stays(&self, vars: &VarRoles, stays: &[String]) -> Result<Self, DataError> {
        let wanted: HashSet<&str> = stays.iter().map(String::as_str).collect();
        let filter = |df: &DataFrame| -> Result<DataFrame, DataError> {
            let keys = group_keys(df, &vars.group)?;
            let flags: Vec<bool> = keys.iter().map(|k| wanted.contains(k.as_str())).collect();
            let mask = BooleanChunked::from_slice("mask".into(), &flags);
            Ok(df.filter(&mask)?)
        };
        Ok(Self {
            static_df: filter(&self.static_df)?,
            dynamic_df: filter(&self.dynamic_df)?,
            outcome_df: filter(&self.outcome_df)?,
        })
    }
}

/// Loads `sta.csv`, `dyn.csv` and `outc.csv` from `data_dir`.
pub fn load_tables(data_dir: &Path) -> Result<SplitTables, DataError> {
    log::info!("Loading tables from '{}'", data_dir.display());
    let tables = SplitTables {
        static_df: read_csv(&data_dir.join(STATIC_FILE))?,
        dynamic_df: read_csv(&data_dir.join(DYNAMIC_FILE))?,
        outcome_df: read_csv(&data_dir.join(OUTCOME_FILE))?,
    };
    log::info!(
        "Loaded {} static, {} dynamic and {} outcome rows.",
        tables.static_df.height(),
        tables.dynamic_df.height(),
        tables.outcome_df.height()
    );
    Ok(tables)
}

fn read_csv(path: &Path) -> Result<DataFrame, DataError> {
    let file = File::open(path).map_err(|source| DataError::IoError {
        path: path.to_path_buf(),
        source,
    })?;
    let df = CsvReader::new(file)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;
    Ok(df)
}

/// Reads the group column as strings, whatever its stored dtype.
pub(crate) fn group_keys(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
    let column = df
        .column(column_name)
        .map_err(|_| DataError::ColumnNotFound(column_name.to_string()))?;
    if column.null_count() > 0 {
        return Err(DataError::MissingGroupKey(column_name.to_string()));
    }
    let casted = column
        .cast(&DataType::String)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "string-convertible key",
            found_type: format!("{:?}", column.dtype()),
        })?;
    let keys = casted
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect();
    Ok(keys)
}

/// Reads a numeric column as `f64`. Missing cells become NaN.
pub(crate) fn float_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let column = df
        .column(column_name)
        .map_err(|_| DataError::ColumnNotFound(column_name.to_string()))?;
    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", column.dtype()),
    };
    let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    // A non-strict cast turns unparsable cells into nulls.
    if casted.null_count() > column.null_count() {
        return Err(wrong_type());
    }
    let values = casted
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    Ok(values)
}

/// Column names of `df` other than the excluded ones, in table order.
pub(crate) fn feature_columns(df: &DataFrame, exclude: &[&str]) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .filter(|name| !exclude.contains(&name.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> SplitTables {
        SplitTables::new(
            df!("stay_id" => [10i64, 11, 12], "age" => [60.0, 70.0, 80.0]).unwrap(),
            df!(
                "stay_id" => [10i64, 10, 11, 12, 12],
                "time" => [0i64, 1, 0, 0, 1],
                "hr" => [80.0, 82.0, 90.0, 70.0, 71.0]
            )
            .unwrap(),
            df!("stay_id" => [10i64, 11, 12], "label" => [0.0, 1.0, 0.0]).unwrap(),
        )
    }

    #[test]
    fn split_names_parse_case_insensitively() {
        assert_eq!("Train".parse::<Split>().unwrap(), Split::Train);
        assert_eq!("validation".parse::<Split>().unwrap(), Split::Val);
        assert!(matches!(
            "holdout".parse::<Split>(),
            Err(DataError::UnknownSplit(_))
        ));
    }

    #[test]
    fn integer_group_keys_become_strings() {
        let keys = group_keys(&tables().static_df, "stay_id").unwrap();
        assert_eq!(keys, vec!["10", "11", "12"]);
    }

    #[test]
    fn selecting_stays_filters_every_table() {
        let vars = VarRoles::default();
        let subset = tables()
            .select_stays(&vars, &["12".to_string(), "10".to_string()])
            .unwrap();
        assert_eq!(subset.static_df.height(), 2);
        assert_eq!(subset.dynamic_df.height(), 4);
        assert_eq!(subset.outcome_df.height(), 2);
        assert_eq!(subset.stay_ids(&vars).unwrap(), vec!["10", "12"]);
    }

    #[test]
    fn missing_numeric_cells_read_as_nan() {
        let df = df!("x" => [Some(1.0), None, Some(3.0)]).unwrap();
        let values = float_column(&df, "x").unwrap();
        assert_eq!(values[0], 1.0);
        assert!(values[1].is_nan());
    }

    #[test]
    fn text_in_numeric_column_is_rejected() {
        let df = df!("x" => ["1.0", "high"]).unwrap();
        assert!(matches!(
            float_column(&df, "x"),
            Err(DataError::ColumnWrongType { .. })
        ));
    }

    #[test]
    fn roles_come_from_configuration() {
        let mut config = ConfigStore::new();
        config.bind("Dataset.vars.GROUP", "patient");
        let vars = VarRoles::from_config(&config).unwrap();
        assert_eq!(vars.group, "patient");
        assert_eq!(vars.sequence, "time");
        assert_eq!(vars.label, "label");
    }
}
