use crate::encoder::FeatureSchema;
use crate::error::{DataIntegrityError, IecvError};
use crate::records::RecordSet;
use crate::trainer::FittedModel;
use ndarray::{Array1, ArrayView1, ArrayView2};

/// X * beta for an already encoded design.
pub fn linear_predictor(
    model: &FittedModel,
    design: ArrayView2<f64>,
) -> Result<Array1<f64>, IecvError> {
    if design.ncols() != model.coefficients.len() {
        return Err(DataIntegrityError::DimensionMismatch(format!(
            "design has {} columns, model has {} coefficients",
            design.ncols(),
            model.coefficients.len()
        ))
        .into());
    }
    Ok(design.dot(&model.coefficients))
}

/// Prognostic index of `records` under `model`. `schema` must be the schema
/// the model was trained with.
pub fn project(
    model: &FittedModel,
    schema: &FeatureSchema,
    records: &RecordSet,
) -> Result<Array1<f64>, IecvError> {
    model.schema.ensure_identical(schema)?;
    let design = schema.transform(records)?;
    linear_predictor(model, design.values.view())
}

/// Probability of the event by `horizon`: 1 - exp(-H0(horizon) * exp(pi)).
pub fn event_probability(model: &FittedModel, pi: ArrayView1<f64>, horizon: f64) -> Array1<f64> {
    let cumulative = model.baseline.at(horizon);
    pi.mapv(|eta| -(-cumulative * eta.exp()).exp_m1())
}
