//! Domain policy checks run against generated text.
//!
//! A [`Validator`] is a named predicate. The pipeline runs each one in
//! isolation: an error or panic in one check becomes a failed entry for that
//! name and never stops the rest.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::error::ValidatorError;

type Check = dyn Fn(&str) -> Result<bool, ValidatorError> + Send + Sync;

#[derive(Clone)]
pub struct Validator {
    name: String,
    check: Arc<Check>,
}

impl Validator {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&str) -> Result<bool, ValidatorError> + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), check: Arc::new(check) }
    }

    pub fn from_fn(name: impl Into<String>, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::new(name, move |text| Ok(check(text)))
    }

    /// Fails any text matching `pattern` (case-insensitive).
    pub fn forbid_pattern(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        let re = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self::from_fn(name, move |text| !re.is_match(text)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, text: &str) -> Result<bool, ValidatorError> {
        match catch_unwind(AssertUnwindSafe(|| (self.check)(text))) {
            Ok(res) => res,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "validator panicked".to_string());
                Err(ValidatorError::new(msg))
            }
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Result recorded per validator: the verdict, or the failure of the check itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidationOutcome {
    Checked(bool),
    Errored { passed: bool, error: String },
}

impl ValidationOutcome {
    pub fn errored(error: impl Into<String>) -> Self {
        ValidationOutcome::Errored { passed: false, error: error.into() }
    }

    pub fn passed(&self) -> bool {
        match self {
            ValidationOutcome::Checked(v) => *v,
            ValidationOutcome::Errored { .. } => false,
        }
    }
}

pub fn run_validators(validators: &[Validator], text: &str) -> BTreeMap<String, ValidationOutcome> {
    validators
        .iter()
        .map(|v| {
            let outcome = match v.check(text) {
                Ok(passed) => ValidationOutcome::Checked(passed),
                Err(e) => {
                    tracing::warn!(validator = v.name(), "validator failed: {e}");
                    ValidationOutcome::errored(e.to_string())
                }
            };
            (v.name().to_string(), outcome)
        })
        .collect()
}

fn contains_any(response: &str, phrases: &[&str]) -> bool {
    let lower = response.to_lowercase();
    phrases.iter().any(|p| lower.contains(p))
}

/// Financial services: no approval guarantees.
pub fn check_no_guarantees(response: &str) -> bool {
    !contains_any(
        response,
        &["guaranteed", "definitely approved", "promise you", "will be approved", "assured approval", "100% approval"],
    )
}

/// Healthcare: no diagnoses or prescriptions.
pub fn check_no_medical_advice(response: &str) -> bool {
    !contains_any(
        response,
        &["you have", "diagnosed with", "you are suffering from", "take this medication", "prescribe", "medical diagnosis"],
    )
}

/// Tutoring: no direct solutions or final calculations.
pub fn check_no_homework_answers(response: &str) -> bool {
    !contains_any(
        response,
        &["the answer is", "the solution is", "here's the answer", "the correct answer", "= "],
    )
}

pub fn no_guarantees() -> Validator {
    Validator::from_fn("check_no_guarantees", check_no_guarantees)
}

pub fn no_medical_advice() -> Validator {
    Validator::from_fn("check_no_medical_advice", check_no_medical_advice)
}

pub fn no_homework_answers() -> Validator {
    Validator::from_fn("check_no_homework_answers", check_no_homework_answers)
}

/// Word-count bounds, inclusive on both ends.
pub fn check_response_length(min_words: usize, max_words: usize) -> Validator {
    Validator::from_fn(format!("check_response_length_{min_words}_{max_words}"), move |text| {
        let words = text.split_whitespace().count();
        (min_words..=max_words).contains(&words)
    })
}
