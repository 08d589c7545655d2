use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::duration::parse_duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("`vus` must be non-negative")]
    InvalidVus,

    #[error("`vus` ({vus}) may not exceed `vus-max` ({vus_max})")]
    VusExceedMax { vus: i64, vus_max: i64 },

    #[error("`acceptance` must be between 0 and 1")]
    InvalidAcceptance,

    #[error("`max-redirects` must be non-negative")]
    InvalidMaxRedirects,
}

/// A tri-valued option field: unset, explicitly null, or a value.
///
/// Merging is layered (runner defaults, config files, CLI flags, live API
/// patches), so "not mentioned" and "explicitly cleared" must stay
/// distinguishable until the merge is locked in with [`Options::set_all_valid`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptField<T> {
    pub value: Option<T>,
    pub valid: bool,
}

impl<T> Default for OptField<T> {
    fn default() -> Self {
        Self {
            value: None,
            valid: false,
        }
    }
}

impl<T> OptField<T> {
    pub fn some(value: T) -> Self {
        Self {
            value: Some(value),
            valid: true,
        }
    }

    pub fn null() -> Self {
        Self {
            value: None,
            valid: true,
        }
    }

    pub fn unset() -> Self {
        Self::default()
    }

    /// Overwrite with `other` when `other` is valid.
    pub fn apply(&mut self, other: &Self)
    where
        T: Clone,
    {
        if other.valid {
            *self = other.clone();
        }
    }

    pub fn value_or(&self, default: T) -> T
    where
        T: Clone,
    {
        self.value.clone().unwrap_or(default)
    }
}

// Deserializing a present field always marks it valid; a missing field falls
// back to `Default` (invalid) via `#[serde(default)]` on the container field.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for OptField<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Option::<T>::deserialize(deserializer)?;
        Ok(Self { value, valid: true })
    }
}

impl<T: Serialize> Serialize for OptField<T> {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

fn de_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<OptField<Duration>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(OptField::null()),
        Some(raw) => parse_duration(&raw)
            .map(OptField::some)
            .map_err(serde::de::Error::custom),
    }
}

fn de_thresholds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<String>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(metric, exprs)| {
            let exprs = match exprs {
                OneOrMany::One(e) => vec![e],
                OneOrMany::Many(v) => v,
            };
            (metric, exprs)
        })
        .collect())
}

/// The merged tunables record; doubles as the YAML config schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Options {
    #[serde(default)]
    pub paused: OptField<bool>,

    #[serde(default)]
    pub vus: OptField<i64>,

    #[serde(default, alias = "vus_max", alias = "max")]
    pub vus_max: OptField<i64>,

    /// Test duration; zero means unbounded.
    #[serde(default, deserialize_with = "de_duration", serialize_with = "ser_duration")]
    pub duration: OptField<Duration>,

    #[serde(default)]
    pub linger: OptField<bool>,

    #[serde(default, alias = "abort_on_taint")]
    pub abort_on_taint: OptField<bool>,

    /// Tolerated fraction of failed checks. Advisory; reported, not enforced.
    #[serde(default)]
    pub acceptance: OptField<f64>,

    #[serde(default, alias = "max_redirects")]
    pub max_redirects: OptField<i64>,

    /// Metric name to ordered threshold expressions. Later layers replace
    /// whole keys.
    #[serde(default, deserialize_with = "de_thresholds")]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

fn ser_duration<S: serde::Serializer>(
    field: &OptField<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    field
        .value
        .map(|d| crate::duration::format_duration(d))
        .serialize(serializer)
}

impl Options {
    /// Field-wise overlay: every valid field of `other` overwrites ours.
    pub fn apply(&mut self, other: &Options) {
        self.paused.apply(&other.paused);
        self.vus.apply(&other.vus);
        self.vus_max.apply(&other.vus_max);
        self.duration.apply(&other.duration);
        self.linger.apply(&other.linger);
        self.abort_on_taint.apply(&other.abort_on_taint);
        self.acceptance.apply(&other.acceptance);
        self.max_redirects.apply(&other.max_redirects);
        for (metric, exprs) in &other.thresholds {
            self.thresholds.insert(metric.clone(), exprs.clone());
        }
    }

    /// Lock the merge in: every field becomes valid, so lower layers can no
    /// longer be distinguished from defaults.
    pub fn set_all_valid(&mut self) {
        self.paused.valid = true;
        self.vus.valid = true;
        self.vus_max.valid = true;
        self.duration.valid = true;
        self.linger.valid = true;
        self.abort_on_taint.valid = true;
        self.acceptance.valid = true;
        self.max_redirects.valid = true;
    }

    /// Enforce cross-field invariants after the merge. `vus_max` defaults to
    /// `vus` when it carries no value of its own.
    pub fn normalize(&mut self) -> Result<()> {
        if self.vus_max.value.is_none() {
            self.vus_max = OptField {
                value: self.vus.value,
                valid: self.vus.valid,
            };
        }

        if let Some(vus) = self.vus.value {
            if vus < 0 {
                return Err(Error::InvalidVus);
            }
            if let Some(vus_max) = self.vus_max.value
                && vus > vus_max
            {
                return Err(Error::VusExceedMax { vus, vus_max });
            }
        }

        if let Some(acceptance) = self.acceptance.value
            && !(0.0..=1.0).contains(&acceptance)
        {
            return Err(Error::InvalidAcceptance);
        }

        if let Some(max_redirects) = self.max_redirects.value
            && max_redirects < 0
        {
            return Err(Error::InvalidMaxRedirects);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_field_wise_right_biased() {
        let mut base = Options::default();
        base.vus = OptField::some(10);
        base.paused = OptField::some(false);

        let mut layer = Options::default();
        layer.vus = OptField::some(20);
        // paused untouched in the layer

        base.apply(&layer);
        assert_eq!(base.vus, OptField::some(20));
        assert_eq!(base.paused, OptField::some(false));
    }

    #[test]
    fn apply_twice_with_equal_input_is_idempotent() {
        let mut layer = Options::default();
        layer.vus = OptField::some(7);
        layer.duration = OptField::some(Duration::from_secs(30));

        let mut once = Options::default();
        once.apply(&layer);
        let mut twice = once.clone();
        twice.apply(&layer);

        assert_eq!(once, twice);
    }

    #[test]
    fn apply_propagates_explicit_null() {
        let mut base = Options::default();
        base.vus = OptField::some(10);

        let mut layer = Options::default();
        layer.vus = OptField::null();

        base.apply(&layer);
        assert_eq!(base.vus, OptField::null());
    }

    #[test]
    fn yaml_distinguishes_missing_null_and_value() {
        let opts: Options = serde_yaml::from_str("vus: 4\nvus-max: null\n").unwrap();

        assert_eq!(opts.vus, OptField::some(4));
        assert_eq!(opts.vus_max, OptField::null());
        assert!(!opts.duration.valid);
    }

    #[test]
    fn yaml_parses_durations_and_thresholds() {
        let opts: Options = serde_yaml::from_str(
            "duration: 90s\nthresholds:\n  latency: p(95)<100\n  errors:\n    - count<1\n    - rate<0.01\n",
        )
        .unwrap();

        assert_eq!(opts.duration, OptField::some(Duration::from_secs(90)));
        assert_eq!(
            opts.thresholds.get("latency"),
            Some(&vec!["p(95)<100".to_string()])
        );
        assert_eq!(
            opts.thresholds.get("errors"),
            Some(&vec!["count<1".to_string(), "rate<0.01".to_string()])
        );
    }

    #[test]
    fn normalize_defaults_vus_max_to_vus() {
        let mut opts = Options::default();
        opts.vus = OptField::some(12);
        opts.normalize().unwrap();
        assert_eq!(opts.vus_max, OptField::some(12));
    }

    #[test]
    fn normalize_rejects_vus_above_max() {
        let mut opts = Options::default();
        opts.vus = OptField::some(12);
        opts.vus_max = OptField::some(4);
        assert!(matches!(
            opts.normalize(),
            Err(Error::VusExceedMax { vus: 12, vus_max: 4 })
        ));
    }

    #[test]
    fn normalize_rejects_out_of_range_acceptance() {
        let mut opts = Options::default();
        opts.acceptance = OptField::some(1.5);
        assert!(matches!(opts.normalize(), Err(Error::InvalidAcceptance)));
    }
}
