//! Request validation.

use tracing::{debug, warn};

use crate::{FineTuneConfig, MergeError, Result, SourceProbe};

/// Checks a [`FineTuneConfig`] before any expensive or mutating work.
///
/// A request without fine-tuned checkpoints is rejected up front. Every
/// model identifier is then probed in the order base, target, fine-tunes and
/// the first one that does not exist is reported. Weight and density lengths
/// are checked last.
pub struct Validator<'a> {
    probe: &'a dyn SourceProbe,
}

impl<'a> Validator<'a> {
    /// Create a validator that resolves identifiers with `probe`.
    pub fn new(probe: &'a dyn SourceProbe) -> Self {
        Self { probe }
    }

    /// Validate the request.
    pub fn validate(&self, config: &FineTuneConfig) -> Result<()> {
        check_finetunes_present(config)?;

        for identifier in config.model_identifiers() {
            debug!("Probing {}", identifier);
            if !self.probe.exists(identifier) {
                return Err(MergeError::InvalidPath {
                    path: identifier.to_string(),
                });
            }
        }

        check_parameter_counts(config)?;
        warn_suspicious_parameters(config);

        Ok(())
    }
}

/// Check that there is at least one fine-tuned checkpoint and that supplied
/// weight and density vectors have one entry per merged model.
pub fn check_parameter_counts(config: &FineTuneConfig) -> Result<()> {
    check_finetunes_present(config)?;

    let expected = config.expected_parameter_count();
    for (parameter, values) in [("weights", &config.weights), ("densities", &config.densities)] {
        if let Some(values) = values {
            if values.len() != expected {
                return Err(MergeError::ParameterCountMismatch {
                    parameter,
                    expected,
                    actual: values.len(),
                });
            }
        }
    }

    Ok(())
}

fn check_finetunes_present(config: &FineTuneConfig) -> Result<()> {
    if config.finetune_outputs.is_empty() {
        return Err(MergeError::NotEnoughModels {
            expected: 1,
            actual: 0,
        });
    }
    Ok(())
}

fn warn_suspicious_parameters(config: &FineTuneConfig) {
    if let Some(weights) = &config.weights {
        for (i, w) in weights.iter().enumerate() {
            if !w.is_finite() {
                warn!("weights[{}] = {} is not finite", i, w);
            }
        }
    }
    if let Some(densities) = &config.densities {
        for (i, d) in densities.iter().enumerate() {
            if !(0.0..=1.0).contains(d) {
                warn!("densities[{}] = {} is outside [0.0, 1.0]", i, d);
            }
        }
    }
}
