/// Limits, PSF thresholds and size classification
use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;

use crate::error::{Result, StarError};
use crate::star::{SizeBucket, Star};
use crate::statistics::{FeatureStats, StarStatistics};

/// Fractions of the [min, max] range used as high/low limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitFactors {
    pub high: f64,
    pub low: f64,
}

impl Default for LimitFactors {
    fn default() -> Self {
        Self {
            high: 0.75,
            low: 0.25,
        }
    }
}

impl LimitFactors {
    /// Low factor clamped so the range is never inverted
    pub fn effective_low(&self) -> f64 {
        self.low.min(self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    pub size: LimitFactors,
    pub width: LimitFactors,
    pub flux: LimitFactors,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureLimits {
    pub high: f64,
    pub low: f64,
}

impl FeatureLimits {
    pub fn from_stats(stats: &FeatureStats, factors: &LimitFactors) -> Self {
        Self {
            high: stats.value_at_fraction(factors.high),
            low: stats.value_at_fraction(factors.effective_low()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Limits {
    pub size: FeatureLimits,
    pub width: FeatureLimits,
    pub flux: FeatureLimits,
}

/// Per-feature limits from the detection statistics
pub fn compute_limits(stats: &StarStatistics, factors: &LimitConfig) -> Limits {
    Limits {
        size: FeatureLimits::from_stats(&stats.size, &factors.size),
        width: FeatureLimits::from_stats(&stats.width, &factors.width),
        flux: FeatureLimits::from_stats(&stats.flux, &factors.flux),
    }
}

/// Classification result of one star
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub bucket: SizeBucket,
    pub enlargement_factor: f64,
}

/// Big at or above the high size limit, small at or below the low one
pub fn classify(star: &Star, limits: &Limits) -> Classification {
    let bucket = if star.size() >= limits.size.high {
        SizeBucket::Big
    } else if star.size() <= limits.size.low {
        SizeBucket::Small
    } else {
        SizeBucket::Average
    };
    Classification {
        bucket,
        enlargement_factor: bucket.enlargement_factor(),
    }
}

/// Threshold value for one feature
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdValue {
    Absolute(f64),
    /// Fraction of the feature's [min, max] range (`"70%"` is 0.7)
    Percent(f64),
    /// Named statistic of the feature (`"avg"`, `"median"`)
    Statistic(String),
}

fn percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*%\s*$").expect("valid percent pattern"))
}

/// Parse `"NN%"` into a fraction
pub fn parse_percent(text: &str) -> Option<f64> {
    percent_regex()
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|p| p / 100.0)
}

impl ThresholdValue {
    pub fn parse(text: &str) -> Self {
        if let Some(fraction) = parse_percent(text) {
            ThresholdValue::Percent(fraction)
        } else if let Ok(v) = text.trim().parse::<f64>() {
            ThresholdValue::Absolute(v)
        } else {
            ThresholdValue::Statistic(text.trim().to_string())
        }
    }

    /// Resolve against the statistics of `key`
    pub fn resolve(&self, key: &str, stats: Option<&FeatureStats>) -> Result<f64> {
        let missing = || StarError::InvalidThreshold {
            key: key.to_string(),
            reason: "no statistics available for this feature".to_string(),
        };
        match self {
            ThresholdValue::Absolute(v) => Ok(*v),
            ThresholdValue::Percent(p) => Ok(stats.ok_or_else(missing)?.value_at_fraction(*p)),
            ThresholdValue::Statistic(name) => {
                stats
                    .ok_or_else(missing)?
                    .get(name)
                    .ok_or_else(|| StarError::InvalidThreshold {
                        key: key.to_string(),
                        reason: format!("unknown statistic '{}'", name),
                    })
            }
        }
    }
}

impl fmt::Display for ThresholdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdValue::Absolute(v) => write!(f, "{}", v),
            ThresholdValue::Percent(p) => write!(f, "{}%", p * 100.0),
            ThresholdValue::Statistic(s) => write!(f, "{}", s),
        }
    }
}

impl Serialize for ThresholdValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ThresholdValue::Absolute(v) => serializer.serialize_f64(*v),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ThresholdValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(v) => ThresholdValue::Absolute(v),
            Raw::Text(s) => ThresholdValue::parse(&s),
        })
    }
}

/// Serializable threshold: a number applied to width and flux, or an
/// ordered feature -> value map. Key order is significant.
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdConfig {
    None,
    Uniform(f64),
    Keys(Vec<(String, ThresholdValue)>),
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfig::Keys(vec![
            ("flux".to_string(), ThresholdValue::Statistic("avg".to_string())),
            ("width".to_string(), ThresholdValue::Percent(0.7)),
        ])
    }
}

impl Serialize for ThresholdConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ThresholdConfig::None => serializer.serialize_none(),
            ThresholdConfig::Uniform(v) => serializer.serialize_f64(*v),
            ThresholdConfig::Keys(keys) => {
                let mut map = serializer.serialize_map(Some(keys.len()))?;
                for (k, v) in keys {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ThresholdConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ThresholdVisitor;

        impl<'de> Visitor<'de> for ThresholdVisitor {
            type Value = ThresholdConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("null, a number or a map of feature thresholds")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(ThresholdConfig::None)
            }

            fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(ThresholdConfig::None)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
                Ok(ThresholdConfig::Uniform(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(ThresholdConfig::Uniform(v as f64))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                Ok(ThresholdConfig::Uniform(v as f64))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut keys = Vec::new();
                while let Some((k, v)) = access.next_entry::<String, ThresholdValue>()? {
                    keys.push((k, v));
                }
                Ok(ThresholdConfig::Keys(keys))
            }
        }

        deserializer.deserialize_any(ThresholdVisitor)
    }
}

/// Which stars get a PSF fit
pub enum ThresholdSpec {
    /// No threshold: every star
    None,
    Predicate(Box<dyn Fn(&Star) -> bool>),
    /// Same value for width and flux
    Uniform(f64),
    /// Ordered feature thresholds
    Keys(Vec<(String, ThresholdValue)>),
}

impl fmt::Debug for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdSpec::None => f.write_str("None"),
            ThresholdSpec::Predicate(_) => f.write_str("Predicate(..)"),
            ThresholdSpec::Uniform(v) => f.debug_tuple("Uniform").field(v).finish(),
            ThresholdSpec::Keys(k) => f.debug_tuple("Keys").field(k).finish(),
        }
    }
}

impl From<ThresholdConfig> for ThresholdSpec {
    fn from(config: ThresholdConfig) -> Self {
        match config {
            ThresholdConfig::None => ThresholdSpec::None,
            ThresholdConfig::Uniform(v) => ThresholdSpec::Uniform(v),
            ThresholdConfig::Keys(k) => ThresholdSpec::Keys(k),
        }
    }
}

/// Threshold with every value resolved to a number
pub enum ResolvedThreshold<'a> {
    All,
    Predicate(&'a dyn Fn(&Star) -> bool),
    Keys(Vec<(String, f64)>),
}

/// Resolve percentages and statistic names once, before the star loop
pub fn resolve_threshold<'a>(spec: &'a ThresholdSpec, stats: &StarStatistics) -> Result<ResolvedThreshold<'a>> {
    Ok(match spec {
        ThresholdSpec::None => ResolvedThreshold::All,
        ThresholdSpec::Predicate(f) => ResolvedThreshold::Predicate(f.as_ref()),
        ThresholdSpec::Uniform(v) => {
            ResolvedThreshold::Keys(vec![("width".to_string(), *v), ("flux".to_string(), *v)])
        }
        ThresholdSpec::Keys(keys) => {
            let mut resolved = Vec::with_capacity(keys.len());
            for (key, value) in keys {
                let v = value.resolve(key, stats.feature(key))?;
                tracing::debug!("PSF threshold {} >= {} ({})", key, v, value);
                resolved.push((key.clone(), v));
            }
            ResolvedThreshold::Keys(resolved)
        }
    })
}

/// Whether `star` qualifies for PSF estimation.
///
/// Keys are checked in order; only keys the star has as numeric
/// features participate, and the first failing comparison decides.
/// A star matching none of the keys does not qualify.
pub fn should_compute_psf(star: &Star, threshold: &ResolvedThreshold<'_>) -> bool {
    match threshold {
        ResolvedThreshold::All => true,
        ResolvedThreshold::Predicate(f) => f(star),
        ResolvedThreshold::Keys(keys) => {
            let mut do_psf = false;
            for (key, limit) in keys {
                if let Some(value) = star.feature(key) {
                    do_psf = value >= *limit;
                    if !do_psf {
                        break;
                    }
                }
            }
            do_psf
        }
    }
}
