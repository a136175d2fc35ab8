//! Prompt and sampling parameter validation.
//!
//! Validation happens at the UI boundary: nothing reaches a backend unless it
//! has passed through [`Prompt::new`] and, for user-adjustable parameters,
//! [`SamplingParams::new`].

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STEPS_RANGE: RangeInclusive<usize> = 10..=100;
pub const GUIDANCE_RANGE: RangeInclusive<f64> = 1.0..=20.0;

pub const DEFAULT_STEPS: usize = 30;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// Pre-filled negative prompt of the hosted-model UI.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, watermark";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Please enter a prompt")]
    EmptyPrompt,

    #[error("inference steps must be within {min}..={max}, got {got}", min = STEPS_RANGE.start(), max = STEPS_RANGE.end())]
    StepsOutOfRange { got: usize },

    #[error("guidance scale must be within {min}..={max}, got {got}", min = GUIDANCE_RANGE.start(), max = GUIDANCE_RANGE.end())]
    GuidanceOutOfRange { got: f64 },
}

/// A non-empty prompt. Surrounding whitespace is preserved as typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt(String);

impl Prompt {
    pub fn new(text: impl Into<String>) -> Result<Self, ValidationError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub steps: usize,
    pub guidance_scale: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
        }
    }
}

impl SamplingParams {
    pub fn new(steps: usize, guidance_scale: f64) -> Result<Self, ValidationError> {
        if !STEPS_RANGE.contains(&steps) {
            return Err(ValidationError::StepsOutOfRange { got: steps });
        }
        // `contains` is false for NaN, so non-finite values are rejected too.
        if !GUIDANCE_RANGE.contains(&guidance_scale) {
            return Err(ValidationError::GuidanceOutOfRange {
                got: guidance_scale,
            });
        }
        Ok(Self {
            steps,
            guidance_scale,
        })
    }

    /// Fills missing values from the defaults before validating.
    pub fn from_optional(
        steps: Option<usize>,
        guidance_scale: Option<f64>,
    ) -> Result<Self, ValidationError> {
        let defaults = Self::default();
        Self::new(
            steps.unwrap_or(defaults.steps),
            guidance_scale.unwrap_or(defaults.guidance_scale),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_prompts_are_rejected() {
        assert_eq!(Prompt::new(""), Err(ValidationError::EmptyPrompt));
        assert_eq!(Prompt::new("  \t\n"), Err(ValidationError::EmptyPrompt));
        assert_eq!(
            Prompt::new(" a red fox ").unwrap().as_str(),
            " a red fox "
        );
    }

    #[test]
    fn steps_bounds_are_inclusive() {
        assert!(SamplingParams::new(10, 7.5).is_ok());
        assert!(SamplingParams::new(100, 7.5).is_ok());
        assert_eq!(
            SamplingParams::new(9, 7.5),
            Err(ValidationError::StepsOutOfRange { got: 9 })
        );
        assert_eq!(
            SamplingParams::new(101, 7.5),
            Err(ValidationError::StepsOutOfRange { got: 101 })
        );
    }

    #[test]
    fn guidance_bounds() {
        assert!(SamplingParams::new(30, 1.0).is_ok());
        assert!(SamplingParams::new(30, 20.0).is_ok());
        assert!(SamplingParams::new(30, 0.5).is_err());
        assert!(SamplingParams::new(30, 20.5).is_err());
        assert!(SamplingParams::new(30, f64::NAN).is_err());
        assert!(SamplingParams::new(30, f64::INFINITY).is_err());
    }

    #[test]
    fn optional_values_fall_back_to_defaults() {
        let params = SamplingParams::from_optional(None, Some(12.0)).unwrap();
        assert_eq!(params.steps, DEFAULT_STEPS);
        assert_eq!(params.guidance_scale, 12.0);
        assert_eq!(
            SamplingParams::from_optional(None, None).unwrap(),
            SamplingParams::default()
        );
    }
}
