use crate::fitness::{FitnessValue, TargetId};
use crate::individual::{Action, ActionResult, Individual};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::fmt;

/// Errors crossing the evaluation boundary. Only `Infrastructure` terminates
/// the run; evaluators are expected to fold per-action faults (timeouts, SUT
/// crashes) into a degraded but well-formed `FitnessValue` instead of
/// returning `Fault`.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// An evaluation-level fault the evaluator could not express as fitness;
    /// absorbed by the search loop as a skipped iteration
    Fault { description: String },
    /// The controller or system under test is unreachable; fatal to the run
    Infrastructure { description: String },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Fault { description } => write!(f, "evaluation fault: {}", description),
            EvalError::Infrastructure { description } => {
                write!(f, "infrastructure fault: {}", description)
            }
        }
    }
}

impl std::error::Error for EvalError {}

/// Everything one evaluation produces
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub fitness: FitnessValue,
    pub results: Vec<ActionResult>,
}

/// The external fitness collaborator. Typically performs network I/O against
/// the system under test; each action is bounded by `timeout_ms`.
pub trait FitnessFunction {
    fn evaluate(
        &mut self,
        individual: &Individual,
        timeout_ms: u64,
    ) -> Result<Evaluation, EvalError>;

    /// Descriptive names of known targets, for reporting only
    fn target_names(&self) -> BTreeMap<TargetId, String> {
        BTreeMap::new()
    }
}

/// The external sampler/builder collaborator: provides fresh random
/// individuals and the action repertoire structural mutation draws from.
pub trait Sampler {
    fn sample_random(&self, rng: &mut ChaCha8Rng) -> Individual;

    /// One random action from the repertoire
    fn random_action(&self, rng: &mut ChaCha8Rng) -> Action;
}

/// Read access to responses harvested from real external services by a
/// concurrent collaborator. Lookups must never block: "no data yet" is the
/// normal answer early in a run.
pub trait ResponseHarvester {
    fn get_copy_of_actual_response(&self, key: &str) -> Option<String>;
}

/// Default harvester with no data
pub struct NoHarvest;

impl ResponseHarvester for NoHarvest {
    fn get_copy_of_actual_response(&self, _key: &str) -> Option<String> {
        None
    }
}
