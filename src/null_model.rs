//! Module for fitting the baseline (covariates-only) model.
use crate::model::{Formula, ModelFrame};
use crate::regression::{fit_glm, FitError, FitOptions};
use crate::{BaselineFit, Family};

/// Fits the baseline model on the complete-case rows of `model_frame`.
/// This is the main entry point for Step 1. A failure here is fatal for the scan.
pub fn fit_null_model(
    model_frame: &ModelFrame,
    formula: &Formula,
    family: Family,
    options: &FitOptions,
) -> Result<BaselineFit, FitError> {
    log::info!(
        "Fitting {} baseline model '{}' on {} samples",
        family,
        formula,
        model_frame.y.len()
    );

    let fit = fit_glm(&model_frame.x, &model_frame.y, family, options)?;

    log::info!(
        "Baseline fit converged after {} iterations, log-likelihood = {:.6}",
        fit.iterations,
        fit.log_likelihood
    );
    for (name, (beta, se)) in model_frame
        .column_names
        .iter()
        .zip(fit.coefficients.iter().zip(fit.standard_errors.iter()))
    {
        log::debug!("  {:<16} beta = {:>12.6}  se = {:.6}", name, beta, se);
    }

    Ok(BaselineFit {
        formula: formula.clone(),
        family,
        column_names: model_frame.column_names.clone(),
        x: model_frame.x.clone(),
        y: model_frame.y.clone(),
        sample_ids: model_frame.sample_ids.clone(),
        sex: model_frame.sex.clone(),
        fit,
    })
}
