//! Batch fitting of several covariance structures to the same data, and
//! information-criterion comparison of the results.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{CovarianceSpec, EstimationMethod, EstimationSettings};
use crate::data::TrainingData;
use crate::estimate::{fit_areal, fit_geostatistical, EstimationError};
use crate::model::{FittedModel, SpatialSupport};

/// The result of fitting one specification of a batch.
#[derive(Debug)]
pub struct FitOutcome {
    pub spec: CovarianceSpec,
    pub label: String,
    pub result: Result<FittedModel, EstimationError>,
}

impl FitOutcome {
    pub fn model(&self) -> Option<&FittedModel> {
        self.result.as_ref().ok()
    }
}

/// Fits every specification to the same data in parallel. Results come back
/// in the order of `specs`; a failing fit does not affect the others.
pub fn fit_many(
    data: &TrainingData,
    support: &SpatialSupport,
    specs: &[CovarianceSpec],
    settings: &EstimationSettings,
) -> Vec<FitOutcome> {
    log::info!("Fitting {} covariance specifications.", specs.len());
    specs
        .par_iter()
        .map(|spec| {
            let result = match (spec, support) {
                (CovarianceSpec::Geostatistical(geostat), SpatialSupport::Points(coords)) => {
                    fit_geostatistical(data, coords, geostat, settings)
                }
                (CovarianceSpec::Areal(areal), SpatialSupport::Areal(neighborhood)) => {
                    fit_areal(data, neighborhood, areal, settings)
                }
                _ => Err(EstimationError::InvalidInput(format!(
                    "specification '{}' does not match the spatial support",
                    spec.label()
                ))),
            };
            if let Err(e) = &result {
                log::warn!("Fit of '{}' failed: {}", spec.label(), e);
            }
            FitOutcome {
                spec: *spec,
                label: spec.label(),
                result,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Aic,
    #[default]
    Aicc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    /// Position of the model in the compared slice.
    pub model: usize,
    pub label: String,
    pub method: EstimationMethod,
    pub n: usize,
    pub k: usize,
    pub log_likelihood: f64,
    pub aic: f64,
    pub aicc: f64,
    /// Difference to the best value of the chosen criterion.
    pub delta: f64,
}

/// Models ordered from best to worst by `criterion`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonTable {
    pub criterion: Criterion,
    pub rows: Vec<ComparisonRow>,
}

impl ComparisonTable {
    pub fn best(&self) -> Option<&ComparisonRow> {
        self.rows.first()
    }
}

pub fn compare(models: &[&FittedModel], criterion: Criterion) -> ComparisonTable {
    if let Some(first) = models.first() {
        if models.iter().any(|m| m.method() != first.method()) {
            log::warn!(
                "Comparing models estimated by different methods; criteria are not comparable."
            );
        } else if first.method() == EstimationMethod::Reml
            && models.iter().any(|m| m.data().terms != first.data().terms)
        {
            log::warn!(
                "REML likelihoods of models with different fixed effects are not comparable; refit with ML."
            );
        }
    }

    let score = |row: &ComparisonRow| match criterion {
        Criterion::Aic => row.aic,
        Criterion::Aicc => row.aicc,
    };
    let mut rows: Vec<ComparisonRow> = models
        .iter()
        .enumerate()
        .map(|(index, model)| {
            let stats = model.fit_statistics();
            ComparisonRow {
                model: index,
                label: model.spec().label(),
                method: stats.method,
                n: stats.n,
                k: stats.k,
                log_likelihood: stats.log_likelihood,
                aic: stats.aic,
                aicc: stats.aicc,
                delta: 0.0,
            }
        })
        .collect();
    rows.sort_by(|a, b| score(a).total_cmp(&score(b)));
    if let Some(best) = rows.first().map(score) {
        for row in &mut rows {
            row.delta = score(row) - best;
        }
    }
    ComparisonTable { criterion, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArealSpec, GeostatSpec};
    use crate::covariance::GeostatFamily;
    use crate::distance::Coordinate;
    use ndarray::Array2;

    fn grid_data() -> (TrainingData, Vec<Coordinate>) {
        let coords: Vec<Coordinate> = (0..36)
            .map(|i| Coordinate::new((i % 6) as f64, (i / 6) as f64))
            .collect();
        let response: Vec<Option<f64>> = coords
            .iter()
            .enumerate()
            .map(|(i, c)| Some((0.5 * c.x).sin() * (0.3 * c.y).cos() + 0.1 * ((i * 17) % 5) as f64))
            .collect();
        let predictors = Array2::<f64>::zeros((36, 0));
        (TrainingData::new(predictors.view(), &response, &[]).unwrap(), coords)
    }

    #[test]
    fn batch_returns_one_outcome_per_spec_in_order() {
        let (data, coords) = grid_data();
        let specs = [
            CovarianceSpec::Geostatistical(GeostatSpec::new(GeostatFamily::None)),
            CovarianceSpec::Geostatistical(GeostatSpec::new(GeostatFamily::Exponential)),
            CovarianceSpec::Areal(ArealSpec::car(true)),
        ];
        let outcomes = fit_many(
            &data,
            &SpatialSupport::Points(coords),
            &specs,
            &EstimationSettings::default(),
        );
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].label, "none");
        assert_eq!(outcomes[1].label, "exponential");
        assert!(outcomes[0].model().is_some());
        assert!(matches!(
            outcomes[2].result,
            Err(EstimationError::InvalidInput(_))
        ));

        let models: Vec<&FittedModel> = outcomes.iter().filter_map(FitOutcome::model).collect();
        let table = compare(&models, Criterion::Aic);
        assert_eq!(table.rows.len(), models.len());
        assert_eq!(table.best().map(|r| r.delta), Some(0.0));
        for pair in table.rows.windows(2) {
            assert!(pair[0].aic <= pair[1].aic);
            assert!(pair[1].delta >= 0.0);
        }
    }

    #[test]
    fn empty_comparison_is_empty() {
        let table = compare(&[], Criterion::Aicc);
        assert!(table.rows.is_empty());
        assert!(table.best().is_none());
    }
}
