//! Spatial linear models for point-referenced and areal data.
//!
//! Covariance parameters are estimated by profiled REML (or ML), fixed effects
//! by generalized least squares, and predictions are best linear unbiased
//! predictions (kriging) with normal-theory intervals.

pub mod compare;
pub mod config;
pub mod covariance;
pub mod data;
pub mod distance;
pub mod estimate;
pub mod faer_ndarray;
pub mod model;
pub mod neighborhood;
pub mod predict;
pub mod semivariogram;
pub mod structure;

pub use compare::{ComparisonRow, ComparisonTable, Criterion, FitOutcome, compare, fit_many};
pub use config::{
    ArealFamily, ArealSpec, ConfigError, CoordinateColumns, CovarianceSpec, EstimationMethod,
    EstimationSettings, GeostatSpec, IntervalKind, ModelConfig, NuggetSpec, PredictionOptions,
};
pub use covariance::{GeostatFamily, KernelParams};
pub use data::{DataError, SpatialFrame, TrainingData};
pub use distance::{Coordinate, cross_distances, distance_matrix};
pub use estimate::{EstimationError, fit_areal, fit_geostatistical};
pub use model::{
    CoefficientRow, FitStatistics, FittedModel, LeaveOneOut, OptimizerSummary, ParameterRow,
    SpatialSupport, VarianceComponent,
};
pub use neighborhood::{Contiguity, IsolatedUnitWarning, Neighborhood, NeighborhoodError, Polygon};
pub use predict::{PredictionTargets, Predictions};
pub use semivariogram::{
    BinSpec, SemivarianceBin, Semivariogram, SemivariogramOptions, semivariogram,
};
pub use structure::{CovarianceParameters, car_covariance};

/// Fits the model described by `config` to the columns of `frame`.
///
/// Areal models take their neighbourhood from `neighborhood`, which must
/// cover every row of the frame.
pub fn fit(
    config: &ModelConfig,
    frame: &SpatialFrame,
    neighborhood: Option<&Neighborhood>,
) -> Result<FittedModel, EstimationError> {
    config
        .validate()
        .map_err(|e| EstimationError::InvalidInput(e.to_string()))?;
    let data = TrainingData::from_frame(frame, &config.response, &config.predictors)?;
    match (&config.covariance, &config.coordinates) {
        (CovarianceSpec::Geostatistical(spec), Some(columns)) => {
            let coordinates = frame.coordinates(&columns.x, &columns.y)?;
            fit_geostatistical(&data, &coordinates, spec, &config.estimation)
        }
        (CovarianceSpec::Geostatistical(_), None) => Err(EstimationError::InvalidInput(
            "geostatistical models need coordinate columns".to_string(),
        )),
        (CovarianceSpec::Areal(spec), _) => {
            let neighborhood = neighborhood.ok_or_else(|| {
                EstimationError::InvalidInput("areal models need a neighbourhood".to_string())
            })?;
            fit_areal(&data, neighborhood, spec, &config.estimation)
        }
    }
}
