//! Reference Bayesian Knowledge Tracing model.
//!
//! Four parameters per topic: prior mastery, learn (transit) rate, guess and
//! slip. The posterior is folded over the full response history on every
//! call, so the model keeps no state between predictions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Predictor, PredictorError};
use crate::roster::Prediction;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BktParams {
    pub prior: f64,
    pub learn: f64,
    pub guess: f64,
    pub slip: f64,
}

impl BktParams {
    pub fn new(prior: f64, learn: f64, guess: f64, slip: f64) -> Result<Self, PredictorError> {
        let params = Self {
            prior,
            learn,
            guess,
            slip,
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), PredictorError> {
        let closed = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(PredictorError::InvalidParameters(format!(
                    "{name} must be within [0, 1], got {v}"
                )))
            }
        };
        closed("prior", self.prior)?;
        closed("learn", self.learn)?;

        // guess and slip must be strictly inside (0, 1) so neither posterior
        // denominator can reach zero
        for (name, v) in [("guess", self.guess), ("slip", self.slip)] {
            if !(v > 0.0 && v < 1.0) {
                return Err(PredictorError::InvalidParameters(format!(
                    "{name} must be within (0, 1), got {v}"
                )));
            }
        }
        if self.guess + self.slip >= 1.0 {
            return Err(PredictorError::InvalidParameters(format!(
                "guess + slip must be below 1, got {}",
                self.guess + self.slip
            )));
        }
        Ok(())
    }

    pub fn posterior(&self, history: &[bool]) -> f64 {
        let mut p = self.prior;
        for &correct in history {
            let conditional = if correct {
                let hit = p * (1.0 - self.slip);
                hit / (hit + (1.0 - p) * self.guess)
            } else {
                let miss = p * self.slip;
                miss / (miss + (1.0 - p) * (1.0 - self.guess))
            };
            p = conditional + (1.0 - conditional) * self.learn;
        }
        p.clamp(0.0, 1.0)
    }
}

impl Default for BktParams {
    fn default() -> Self {
        Self {
            prior: 0.3,
            learn: 0.1,
            guess: 0.2,
            slip: 0.1,
        }
    }
}

/// Topics without parameters (and no default) are treated as not yet trained.
#[derive(Debug, Clone, Default)]
pub struct BktPredictor {
    topics: HashMap<String, BktParams>,
    default: Option<BktParams>,
}

impl BktPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(params: BktParams) -> Self {
        Self {
            topics: HashMap::new(),
            default: Some(params),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>, params: BktParams) -> Self {
        self.topics.insert(topic.into(), params);
        self
    }

    pub fn params_for(&self, topic: &str) -> Option<&BktParams> {
        self.topics.get(topic).or(self.default.as_ref())
    }
}

impl Predictor for BktPredictor {
    fn predict(&self, topic: &str, history: &[bool]) -> Result<Prediction, PredictorError> {
        if history.is_empty() {
            return Ok(Prediction::Untrained);
        }
        match self.params_for(topic) {
            Some(params) => Ok(Prediction::Mastery(params.posterior(history))),
            None => Ok(Prediction::Untrained),
        }
    }
}
