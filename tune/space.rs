//! # Hyperparameter Search Space
//!
//! Candidates are declared per class in the configuration, under the `hyperparameter`
//! namespace of a scope:
//!
//! ```toml
//! ["logreg/hyperparameter"]
//! class_to_tune = "LogisticClassifier"
//! l2 = [1e-4, 10.0, "log-uniform"]
//! max_iter = 50
//! ```
//!
//! A scalar candidate is bound straight away as `"{class}.{param}"`. A list candidate
//! becomes a [`Dimension`] of the returned [`SearchSpace`]. Anything already bound in the
//! resolved configuration is left alone: an explicit binding always wins over a
//! candidate.

use crate::config::{ConfigError, ConfigStore, ParamValue};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;
use thiserror::Error;

/// Configuration namespace holding the candidates of the active scope.
const CANDIDATE_PREFIX: &str = "hyperparameter.";
const CLASS_KEY: &str = "hyperparameter.class_to_tune";

#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("'{0}' is missing: every tuning scope must name the class it tunes.")]
    MissingClassToTune(String),
    #[error("Invalid bounds for '{name}': {reason}")]
    InvalidBounds { name: String, reason: String },
    #[error("'{0}' declares an empty list of choices.")]
    EmptyChoices(String),
}

/// Sampling prior of a numeric dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Prior {
    Uniform,
    LogUniform,
}

impl Prior {
    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "uniform" => Some(Self::Uniform),
            "log-uniform" => Some(Self::LogUniform),
            _ => None,
        }
    }
}

/// One searchable axis.
#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    Real { low: f64, high: f64, prior: Prior },
    Integer { low: i64, high: i64, prior: Prior },
    Categorical(Vec<ParamValue>),
}

impl Dimension {
    /// Interprets a candidate value. Scalars are not searchable and give `Ok(None)`.
    ///
    /// * `[lo, hi]` of two integers is an integer range, of any other two numbers a real
    ///   range;
    /// * `[lo, hi, "uniform" | "log-uniform"]` is a range with that prior;
    /// * any other list is a set of categorical choices.
    pub fn from_candidate(name: &str, value: &ParamValue) -> Result<Option<Self>, SpaceError> {
        let Some(items) = value.as_list() else {
            return Ok(None);
        };
        let dimension = match items {
            [] => return Err(SpaceError::EmptyChoices(name.to_string())),
            [low, high] if low.is_numeric() && high.is_numeric() => {
                Self::range(name, low, high, Prior::Uniform)?
            }
            [low, high, ParamValue::Str(tag)]
                if low.is_numeric() && high.is_numeric() && Prior::parse(tag).is_some() =>
            {
                let prior = Prior::parse(tag).unwrap_or(Prior::Uniform);
                Self::range(name, low, high, prior)?
            }
            _ => Self::Categorical(items.to_vec()),
        };
        Ok(Some(dimension))
    }

    fn range(
        name: &str,
        low: &ParamValue,
        high: &ParamValue,
        prior: Prior,
    ) -> Result<Self, SpaceError> {
        let invalid = |reason: &str| SpaceError::InvalidBounds {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let dimension = match (low.as_i64(), high.as_i64()) {
            (Some(low), Some(high)) => Self::Integer { low, high, prior },
            _ => {
                let (low, high) = (low.as_f64(), high.as_f64());
                match (low, high) {
                    (Some(low), Some(high)) if low.is_finite() && high.is_finite() => {
                        Self::Real { low, high, prior }
                    }
                    _ => return Err(invalid("bounds must be finite numbers")),
                }
            }
        };
        let (low, high) = dimension.bounds_f64().unwrap_or((0.0, 0.0));
        if low >= high {
            return Err(invalid("the lower bound must be below the upper bound"));
        }
        if prior == Prior::LogUniform && low <= 0.0 {
            return Err(invalid("a log-uniform range needs a positive lower bound"));
        }
        Ok(dimension)
    }

    fn bounds_f64(&self) -> Option<(f64, f64)> {
        match self {
            Self::Real { low, high, .. } => Some((*low, *high)),
            Self::Integer { low, high, .. } => Some((*low as f64, *high as f64)),
            Self::Categorical(_) => None,
        }
    }

    /// Draws a value. Numeric dimensions respect their prior.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self {
            Self::Integer {
                low,
                high,
                prior: Prior::Uniform,
            } => ParamValue::Int(rng.gen_range(*low..=*high)),
            Self::Categorical(choices) => choices[rng.gen_range(0..choices.len())].clone(),
            _ => self.from_unit(rng.gen_range(0.0..1.0)),
        }
    }

    /// Position of `value` in `[0, 1]`, or `None` when the value is not part of this
    /// dimension.
    pub fn to_unit(&self, value: &ParamValue) -> Option<f64> {
        if !self.contains(value) {
            return None;
        }
        match self {
            Self::Real { low, high, prior } => Some(scale(value.as_f64()?, *low, *high, *prior)),
            Self::Integer { low, high, prior } => {
                Some(scale(value.as_f64()?, *low as f64, *high as f64, *prior))
            }
            // Choice `i` of `n` sits at the centre of the bin `[i/n, (i+1)/n)`.
            Self::Categorical(choices) => {
                let index = choices.iter().position(|choice| choice == value)?;
                Some((index as f64 + 0.5) / choices.len() as f64)
            }
        }
    }

    /// The value at position `u` of the unit interval. `u` is clamped to `[0, 1]`.
    pub fn from_unit(&self, u: f64) -> ParamValue {
        let u = if u.is_nan() { 0.5 } else { u.clamp(0.0, 1.0) };
        match self {
            Self::Real { low, high, prior } => ParamValue::Float(unscale(u, *low, *high, *prior)),
            Self::Integer { low, high, prior } => {
                let value = unscale(u, *low as f64, *high as f64, *prior).round() as i64;
                ParamValue::Int(value.clamp(*low, *high))
            }
            Self::Categorical(choices) => {
                let index = ((u * choices.len() as f64) as usize).min(choices.len() - 1);
                choices[index].clone()
            }
        }
    }

    pub fn contains(&self, value: &ParamValue) -> bool {
        match self {
            Self::Real { low, high, .. } => value
                .as_f64()
                .is_some_and(|v| (*low..=*high).contains(&v)),
            Self::Integer { low, high, .. } => value
                .as_i64()
                .is_some_and(|v| (*low..=*high).contains(&v)),
            Self::Categorical(choices) => choices.contains(value),
        }
    }

    /// Centre of the dimension in its own transformed space.
    pub fn midpoint(&self) -> ParamValue {
        self.from_unit(0.5)
    }
}

fn scale(value: f64, low: f64, high: f64, prior: Prior) -> f64 {
    let u = match prior {
        Prior::Uniform => (value - low) / (high - low),
        Prior::LogUniform => (value.ln() - low.ln()) / (high.ln() - low.ln()),
    };
    u.clamp(0.0, 1.0)
}

fn unscale(u: f64, low: f64, high: f64, prior: Prior) -> f64 {
    let value = match prior {
        Prior::Uniform => low + u * (high - low),
        Prior::LogUniform => (low.ln() + u * (high.ln() - low.ln())).exp(),
    };
    value.clamp(low, high)
}

/// Tunable dimensions keyed by their qualified name (`"{class}.{param}"`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchSpace {
    dimensions: BTreeMap<String, Dimension>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, dimension: Dimension) {
        self.dimensions.insert(name.into(), dimension);
    }

    /// Adds every entry of `other`, overwriting entries with the same name.
    pub fn merge(&mut self, other: SearchSpace) {
        self.dimensions.extend(other.dimensions);
    }

    pub fn get(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dimensions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.dimensions.keys()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.values()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Dimension> {
        self.dimensions.iter()
    }
}

impl<'a> IntoIterator for &'a SearchSpace {
    type Item = (&'a String, &'a Dimension);
    type IntoIter = btree_map::Iter<'a, String, Dimension>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Splits `candidates` for `class` into fixed bindings (applied to `config`) and the
/// returned search space.
pub fn hyperparameters_to_tune(
    config: &mut ConfigStore,
    class: &str,
    candidates: &BTreeMap<String, ParamValue>,
) -> Result<SearchSpace, SpaceError> {
    let mut space = SearchSpace::new();
    for (param, value) in candidates {
        let name = format!("{class}.{param}");
        if config.is_bound(&name) {
            log::debug!("'{name}' is already bound; not tuning it.");
            continue;
        }
        match Dimension::from_candidate(&name, value)? {
            Some(dimension) => space.insert(name, dimension),
            None => config.bind(&name, value.clone()),
        }
    }
    Ok(space)
}

/// Reads the `hyperparameter.*` candidates visible in the active scopes and passes them
/// to [`hyperparameters_to_tune`].
pub fn collect_from_scope(config: &mut ConfigStore) -> Result<SearchSpace, SpaceError> {
    let mut candidates = config.resolved_with_prefix(CANDIDATE_PREFIX);
    let class = match candidates.remove(CLASS_KEY) {
        Some(ParamValue::Str(class)) => class,
        Some(other) => {
            return Err(ConfigError::WrongType {
                key: CLASS_KEY.to_string(),
                expected: "string",
                found: other.to_string(),
            }
            .into());
        }
        None => {
            let key = match config.active_scopes().last() {
                Some(scope) => format!("{scope}/{CLASS_KEY}"),
                None => CLASS_KEY.to_string(),
            };
            return Err(SpaceError::MissingClassToTune(key));
        }
    };
    let candidates = candidates
        .into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(CANDIDATE_PREFIX)
                .map(|param| (param.to_string(), value))
        })
        .collect();
    hyperparameters_to_tune(config, &class, &candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn list(values: Vec<ParamValue>) -> ParamValue {
        ParamValue::List(values)
    }

    #[test]
    fn candidate_lists_follow_range_conventions() {
        let int_range = list(vec![0_i64.into(), 10_i64.into()]);
        assert_eq!(
            Dimension::from_candidate("C.b", &int_range).unwrap(),
            Some(Dimension::Integer {
                low: 0,
                high: 10,
                prior: Prior::Uniform
            })
        );

        let real_range = list(vec![0_i64.into(), 1.5.into()]);
        assert!(matches!(
            Dimension::from_candidate("C.b", &real_range).unwrap(),
            Some(Dimension::Real { prior: Prior::Uniform, .. })
        ));

        let log_range = list(vec![1e-4.into(), 10.0.into(), "log-uniform".into()]);
        assert!(matches!(
            Dimension::from_candidate("C.b", &log_range).unwrap(),
            Some(Dimension::Real { prior: Prior::LogUniform, .. })
        ));

        let choices = list(vec![1_i64.into(), 2_i64.into(), 3_i64.into()]);
        assert!(matches!(
            Dimension::from_candidate("C.c", &choices).unwrap(),
            Some(Dimension::Categorical(ref c)) if c.len() == 3
        ));

        assert_eq!(Dimension::from_candidate("C.a", &5_i64.into()).unwrap(), None);
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        let reversed = list(vec![10.0.into(), 1.0.into()]);
        assert!(matches!(
            Dimension::from_candidate("C.x", &reversed),
            Err(SpaceError::InvalidBounds { .. })
        ));
        let non_positive_log = list(vec![0.0.into(), 1.0.into(), "log-uniform".into()]);
        assert!(Dimension::from_candidate("C.x", &non_positive_log).is_err());
        assert!(matches!(
            Dimension::from_candidate("C.x", &list(vec![])),
            Err(SpaceError::EmptyChoices(_))
        ));
    }

    #[test]
    fn unit_transform_inverts_on_grid_points() {
        let dimension = Dimension::Real {
            low: 1e-3,
            high: 1e3,
            prior: Prior::LogUniform,
        };
        let u = dimension.to_unit(&ParamValue::Float(1.0)).unwrap();
        assert!((u - 0.5).abs() < 1e-12);
        let midpoint = dimension.midpoint().as_f64().unwrap();
        assert!((midpoint - 1.0).abs() < 1e-9);

        let choices = Dimension::Categorical(vec!["a".into(), "b".into()]);
        let u = choices.to_unit(&"b".into()).unwrap();
        assert_eq!(choices.from_unit(u), ParamValue::from("b"));
        assert_eq!(choices.to_unit(&"z".into()), None);
    }

    #[test]
    fn categorical_choices_sit_at_bin_centres() {
        let choices: Vec<ParamValue> = vec![1_i64.into(), 2_i64.into(), 3_i64.into(), 4_i64.into()];
        let dimension = Dimension::Categorical(choices.clone());
        for (index, choice) in choices.iter().enumerate() {
            let u = dimension.to_unit(choice).unwrap();
            assert_eq!(u, (index as f64 + 0.5) / 4.0);
            assert_eq!(&dimension.from_unit(u), choice);
        }
        assert_eq!(dimension.from_unit(0.0), choices[0]);
        assert_eq!(dimension.from_unit(1.0), choices[3]);
    }

    #[test]
    fn samples_stay_inside_their_dimension() {
        let mut rng = StdRng::seed_from_u64(3);
        let dimensions = [
            Dimension::Integer {
                low: -2,
                high: 2,
                prior: Prior::Uniform,
            },
            Dimension::Integer {
                low: 1,
                high: 100,
                prior: Prior::LogUniform,
            },
            Dimension::Real {
                low: 0.5,
                high: 0.75,
                prior: Prior::Uniform,
            },
            Dimension::Categorical(vec![true.into(), false.into()]),
        ];
        for dimension in &dimensions {
            for _ in 0..50 {
                assert!(dimension.contains(&dimension.sample(&mut rng)));
            }
        }
    }

    #[test]
    fn scalars_are_bound_and_lists_are_returned() {
        let mut config = ConfigStore::new();
        let candidates = BTreeMap::from([
            ("a".to_string(), ParamValue::Int(5)),
            ("b".to_string(), list(vec![0_i64.into(), 10_i64.into()])),
            (
                "c".to_string(),
                list(vec![1_i64.into(), 2_i64.into(), 3_i64.into()]),
            ),
        ]);
        let space = hyperparameters_to_tune(&mut config, "C", &candidates).unwrap();

        assert_eq!(space.names().cloned().collect::<Vec<_>>(), ["C.b", "C.c"]);
        assert_eq!(config.get("C.a"), Some(&ParamValue::Int(5)));
        assert!(!config.is_bound("C.b"));
    }

    #[test]
    fn explicit_bindings_win_over_candidates() {
        let mut config = ConfigStore::new();
        config.bind("C.b", 7_i64);
        config.bind("C.a", 1_i64);
        let candidates = BTreeMap::from([
            ("a".to_string(), ParamValue::Int(5)),
            ("b".to_string(), list(vec![0_i64.into(), 10_i64.into()])),
        ]);
        let space = hyperparameters_to_tune(&mut config, "C", &candidates).unwrap();

        assert!(space.is_empty());
        assert_eq!(config.get("C.b"), Some(&ParamValue::Int(7)));
        assert_eq!(config.get("C.a"), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn scope_candidates_are_collected() {
        let mut config = ConfigStore::from_toml_str(
            r#"
            ["logreg/hyperparameter"]
            class_to_tune = "LogisticClassifier"
            l2 = [1e-4, 10.0, "log-uniform"]
            max_iter = 50
            "#,
        )
        .unwrap();
        let space = {
            let mut scoped = config.scoped("logreg");
            collect_from_scope(&mut scoped).unwrap()
        };
        assert!(space.contains("LogisticClassifier.l2"));
        assert_eq!(space.len(), 1);
        assert_eq!(config.get_or("LogisticClassifier.max_iter", 0_i64).unwrap(), 50);

        let mut unscoped = ConfigStore::new();
        assert!(matches!(
            collect_from_scope(&mut unscoped),
            Err(SpaceError::MissingClassToTune(_))
        ));
    }
}
