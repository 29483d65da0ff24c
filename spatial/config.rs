//! Model configuration: which columns to use, which covariance structure to
//! fit, how to estimate it and how to predict. Every constructor and every
//! TOML load validates the configuration, so a `ModelConfig` in hand is
//! always internally consistent.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::covariance::GeostatFamily;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How the nugget (independent-error variance) of a geostatistical model is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NuggetSpec {
    #[default]
    Estimate,
    /// Forces a noiseless model; kriging then interpolates observed values.
    Zero,
}

/// A geostatistical covariance specification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeostatSpec {
    pub family: GeostatFamily,
    #[serde(default)]
    pub nugget: NuggetSpec,
    /// Known range; estimated when `None`.
    #[serde(default)]
    pub range: Option<f64>,
}

impl GeostatSpec {
    pub fn new(family: GeostatFamily) -> Self {
        Self {
            family,
            nugget: NuggetSpec::Estimate,
            range: None,
        }
    }

    pub fn with_zero_nugget(mut self) -> Self {
        self.nugget = NuggetSpec::Zero;
        self
    }

    pub fn with_range(mut self, range: f64) -> Self {
        self.range = Some(range);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(range) = self.range {
            if !(range.is_finite() && range > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "fixed range must be positive and finite, got {range}"
                )));
            }
        }
        if let GeostatFamily::Matern {
            smoothness: Some(nu),
        } = self.family
        {
            if !(nu.is_finite() && nu > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "Matérn smoothness must be positive and finite, got {nu}"
                )));
            }
        }
        if self.family == GeostatFamily::None && self.nugget == NuggetSpec::Zero {
            return Err(ConfigError::Invalid(
                "the 'none' family has no dependent variance, so its nugget cannot be zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Areal covariance families. Only the conditional autoregressive model is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArealFamily {
    Car,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArealSpec {
    pub family: ArealFamily,
    #[serde(default = "default_row_standardize")]
    pub row_standardize: bool,
}

fn default_row_standardize() -> bool {
    true
}

impl ArealSpec {
    pub fn car(row_standardize: bool) -> Self {
        Self {
            family: ArealFamily::Car,
            row_standardize,
        }
    }
}

/// One covariance structure to fit; a batch comparison is a list of these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceSpec {
    Geostatistical(GeostatSpec),
    Areal(ArealSpec),
}

impl CovarianceSpec {
    /// Short label used in logs and comparison tables.
    pub fn label(&self) -> String {
        match self {
            CovarianceSpec::Geostatistical(spec) => {
                let mut label = spec.family.name().to_string();
                if spec.nugget == NuggetSpec::Zero {
                    label.push_str(" (no nugget)");
                }
                label
            }
            CovarianceSpec::Areal(spec) => match (spec.family, spec.row_standardize) {
                (ArealFamily::Car, true) => "car".to_string(),
                (ArealFamily::Car, false) => "car (unstandardized)".to_string(),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            CovarianceSpec::Geostatistical(spec) => spec.validate(),
            CovarianceSpec::Areal(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Restricted maximum likelihood.
    #[default]
    Reml,
    /// Maximum likelihood.
    Ml,
}

/// Estimation method and optimizer stopping rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimationSettings {
    #[serde(default)]
    pub method: EstimationMethod,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_max_iterations() -> usize {
    200
}

impl Default for EstimationSettings {
    fn default() -> Self {
        Self {
            method: EstimationMethod::Reml,
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl EstimationSettings {
    pub fn ml() -> Self {
        Self {
            method: EstimationMethod::Ml,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "optimizer tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "optimizer iteration cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which uncertainty band accompanies a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    /// Standard errors of the prediction only.
    None,
    /// Interval for the mean `x₀ᵀβ`.
    Confidence,
    /// Interval for a new observation at the target.
    #[default]
    Prediction,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionOptions {
    #[serde(default)]
    pub interval: IntervalKind,
    #[serde(default = "default_level")]
    pub level: f64,
}

fn default_level() -> f64 {
    0.95
}

impl Default for PredictionOptions {
    fn default() -> Self {
        Self {
            interval: IntervalKind::Prediction,
            level: default_level(),
        }
    }
}

impl PredictionOptions {
    pub fn new(interval: IntervalKind, level: f64) -> Result<Self, ConfigError> {
        let options = Self { interval, level };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.level > 0.0 && self.level < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "prediction level must lie in (0, 1), got {}",
                self.level
            )));
        }
        Ok(())
    }
}

/// Names of the frame columns holding point coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateColumns {
    pub x: String,
    pub y: String,
}

/// The complete, validated description of one model fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub response: String,
    #[serde(default)]
    pub predictors: Vec<String>,
    #[serde(default)]
    pub coordinates: Option<CoordinateColumns>,
    pub covariance: CovarianceSpec,
    #[serde(default)]
    pub estimation: EstimationSettings,
    #[serde(default)]
    pub prediction: PredictionOptions,
}

impl ModelConfig {
    /// Configuration for point-referenced data with coordinates in columns `x` and `y`.
    pub fn geostatistical(
        response: impl Into<String>,
        predictors: Vec<String>,
        x: impl Into<String>,
        y: impl Into<String>,
        spec: GeostatSpec,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            response: response.into(),
            predictors,
            coordinates: Some(CoordinateColumns {
                x: x.into(),
                y: y.into(),
            }),
            covariance: CovarianceSpec::Geostatistical(spec),
            estimation: EstimationSettings::default(),
            prediction: PredictionOptions::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration for areal data; the neighbourhood is supplied at fit time.
    pub fn areal(
        response: impl Into<String>,
        predictors: Vec<String>,
        spec: ArealSpec,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            response: response.into(),
            predictors,
            coordinates: None,
            covariance: CovarianceSpec::Areal(spec),
            estimation: EstimationSettings::default(),
            prediction: PredictionOptions::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_estimation(mut self, estimation: EstimationSettings) -> Result<Self, ConfigError> {
        self.estimation = estimation;
        self.validate()?;
        Ok(self)
    }

    pub fn with_prediction(mut self, prediction: PredictionOptions) -> Result<Self, ConfigError> {
        self.prediction = prediction;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response.is_empty() {
            return Err(ConfigError::Invalid("response column name is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for name in &self.predictors {
            if name.is_empty() {
                return Err(ConfigError::Invalid("predictor column name is empty".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "predictor '{name}' is listed more than once"
                )));
            }
            if *name == self.response {
                return Err(ConfigError::Invalid(format!(
                    "response '{name}' cannot also be a predictor"
                )));
            }
        }
        match (&self.covariance, &self.coordinates) {
            (CovarianceSpec::Geostatistical(_), None) => {
                return Err(ConfigError::Invalid(
                    "geostatistical models need coordinate columns".to_string(),
                ));
            }
            (CovarianceSpec::Geostatistical(_), Some(coords)) => {
                if coords.x == coords.y {
                    return Err(ConfigError::Invalid(
                        "x and y coordinates must be different columns".to_string(),
                    ));
                }
                if coords.x == self.response || coords.y == self.response {
                    return Err(ConfigError::Invalid(
                        "a coordinate column cannot be the response".to_string(),
                    ));
                }
                if let Some(name) = self
                    .predictors
                    .iter()
                    .find(|name| **name == coords.x || **name == coords.y)
                {
                    return Err(ConfigError::Invalid(format!(
                        "coordinate column '{name}' cannot also be a predictor"
                    )));
                }
            }
            (CovarianceSpec::Areal(_), _) => {}
        }
        self.covariance.validate()?;
        self.estimation.validate()?;
        self.prediction.validate()?;
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves the configuration in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_geostatistical_config_from_toml() {
        let text = r#"
            response = "log_zinc"
            predictors = ["dist"]

            [coordinates]
            x = "easting"
            y = "northing"

            [covariance.geostatistical]
            nugget = "estimate"

            [covariance.geostatistical.family]
            kind = "matern"
            smoothness = 1.5

            [estimation]
            method = "ml"
            max_iterations = 50
        "#;
        let config = ModelConfig::from_toml_str(text).unwrap();
        assert_eq!(config.response, "log_zinc");
        assert_eq!(config.estimation.method, EstimationMethod::Ml);
        assert_eq!(config.estimation.max_iterations, 50);
        assert_eq!(config.estimation.tolerance, 1e-6);
        assert_eq!(config.prediction, PredictionOptions::default());
        match config.covariance {
            CovarianceSpec::Geostatistical(spec) => {
                assert_eq!(
                    spec.family,
                    GeostatFamily::Matern {
                        smoothness: Some(1.5)
                    }
                );
                assert_eq!(spec.range, None);
            }
            other => panic!("unexpected covariance {other:?}"),
        }
    }

    #[test]
    fn parses_areal_config_with_defaults() {
        let text = r#"
            response = "log_trend"

            [covariance.areal]
            family = "car"
        "#;
        let config = ModelConfig::from_toml_str(text).unwrap();
        assert_eq!(config.covariance, CovarianceSpec::Areal(ArealSpec::car(true)));
        assert!(config.predictors.is_empty());
    }

    #[test]
    fn validation_rejects_inconsistent_configs() {
        let spec = GeostatSpec::new(GeostatFamily::Exponential);
        assert!(ModelConfig::geostatistical("z", vec!["z".into()], "x", "y", spec).is_err());
        assert!(
            ModelConfig::geostatistical("z", vec!["a".into(), "a".into()], "x", "y", spec)
                .is_err()
        );
        assert!(ModelConfig::geostatistical("z", vec![], "x", "x", spec).is_err());
        assert!(
            ModelConfig::geostatistical("z", vec![], "x", "y", spec.with_range(-1.0)).is_err()
        );
        let config = ModelConfig::geostatistical("z", vec![], "x", "y", spec).unwrap();
        assert!(
            config
                .clone()
                .with_prediction(PredictionOptions {
                    interval: IntervalKind::Prediction,
                    level: 1.5,
                })
                .is_err()
        );
        let no_coords = r#"
            response = "z"
            [covariance.geostatistical.family]
            kind = "exponential"
        "#;
        assert!(matches!(
            ModelConfig::from_toml_str(no_coords),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn coordinate_columns_cannot_be_predictors() {
        let spec = GeostatSpec::new(GeostatFamily::Exponential);
        let result =
            ModelConfig::geostatistical("z", vec!["elev".into(), "y".into()], "x", "y", spec);
        assert!(matches!(result, Err(ConfigError::Invalid(ref msg)) if msg.contains("'y'")));
        assert!(ModelConfig::geostatistical("z", vec!["x".into()], "x", "y", spec).is_err());

        let text = r#"
            response = "z"
            predictors = ["east"]
            [coordinates]
            x = "east"
            y = "north"
            [covariance.geostatistical.family]
            kind = "spherical"
        "#;
        assert!(matches!(
            ModelConfig::from_toml_str(text),
            Err(ConfigError::Invalid(_))
        ));
        assert!(ModelConfig::geostatistical("z", vec!["elev".into()], "x", "y", spec).is_ok());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let config = ModelConfig::geostatistical(
            "z",
            vec!["elev".into()],
            "x",
            "y",
            GeostatSpec::new(GeostatFamily::Spherical).with_zero_nugget(),
        )
        .unwrap();
        config.save(&path).unwrap();
        let loaded = ModelConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn labels_name_the_family() {
        let spec = CovarianceSpec::Geostatistical(
            GeostatSpec::new(GeostatFamily::Gaussian).with_zero_nugget(),
        );
        assert_eq!(spec.label(), "gaussian (no nugget)");
        assert_eq!(
            CovarianceSpec::Areal(ArealSpec::car(false)).label(),
            "car (unstandardized)"
        );
    }
}
