use crate::eval::{EvalError, Evaluation, FitnessFunction, Sampler};
use crate::fitness::{FitnessValue, TargetId};
use crate::gene::Gene;
use crate::individual::{Action, ActionResult, Individual};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

//-----------------------------------------------------------------------------
// Synthetic problems for smoke runs and end-to-end tests
//-----------------------------------------------------------------------------

/// Boolean many-target problem: `targets` independent objectives spread over
/// `actions` actions named `flags<i>`. A target is covered when its gene is
/// true, and reached at 0.25 otherwise, so every individual gives the archive
/// something to hold on to.
pub struct OneMaxProblem {
    targets: usize,
    actions: usize,
}

impl OneMaxProblem {
    pub fn new(targets: usize, actions: usize) -> OneMaxProblem {
        let targets = targets.max(1);
        OneMaxProblem {
            targets,
            actions: actions.clamp(1, targets),
        }
    }

    fn genes_per_action(&self) -> usize {
        (self.targets + self.actions - 1) / self.actions
    }

    fn block_of(name: &str) -> Option<usize> {
        name.strip_prefix("flags")?.parse().ok()
    }

    fn build_action(&self, block: usize, rng: &mut ChaCha8Rng) -> Action {
        let per_action = self.genes_per_action();
        let first = block * per_action;
        let count = per_action.min(self.targets.saturating_sub(first));
        Action {
            name: format!("flags{}", block),
            genes: (0..count)
                .map(|_| Gene::Boolean { value: rng.gen_bool(0.5) })
                .collect(),
            creates: None,
            uses: None,
        }
    }
}

impl FitnessFunction for OneMaxProblem {
    fn evaluate(
        &mut self,
        individual: &Individual,
        _timeout_ms: u64,
    ) -> Result<Evaluation, EvalError> {
        let per_action = self.genes_per_action();
        let mut fitness = FitnessValue::new();
        let mut results = Vec::with_capacity(individual.actions.len());

        for (ai, action) in individual.actions.iter().enumerate() {
            if let Some(block) = Self::block_of(&action.name) {
                for (gi, gene) in action.genes.iter().enumerate() {
                    let target = block * per_action + gi;
                    if target >= self.targets {
                        continue;
                    }
                    if let Gene::Boolean { value } = gene {
                        let score = if *value { 1.0 } else { 0.25 };
                        fitness
                            .set_heuristic(target as TargetId, score, ai)
                            .map_err(|e| EvalError::Fault { description: e.to_string() })?;
                    }
                }
            }
            results.push(ActionResult { action_index: ai, timed_out: false, fault: None });
        }

        Ok(Evaluation { fitness, results })
    }

    fn target_names(&self) -> BTreeMap<TargetId, String> {
        (0..self.targets as TargetId)
            .map(|t| (t, format!("flag_{}", t)))
            .collect()
    }
}

impl Sampler for OneMaxProblem {
    fn sample_random(&self, rng: &mut ChaCha8Rng) -> Individual {
        let mut ind = Individual::new();
        for block in 0..self.actions {
            ind.actions.push(self.build_action(block, rng));
        }
        ind
    }

    fn random_action(&self, rng: &mut ChaCha8Rng) -> Action {
        let block = rng.gen_range(0..self.actions);
        self.build_action(block, rng)
    }
}

/// Numeric gradient problem: one integer probe per target with a hidden
/// optimum, heuristic falling off linearly with the distance to it. Exercises
/// feedback-directed sampling and boundary-narrowing mutation end to end.
pub struct GradientProblem {
    targets: usize,
    range: i64,
}

impl GradientProblem {
    pub fn new(targets: usize, range: i64) -> GradientProblem {
        GradientProblem {
            targets: targets.max(1),
            range: range.max(1),
        }
    }

    fn optimum(&self, target: usize) -> i64 {
        ((target as i64) * 97 + 13) % (self.range + 1)
    }

    fn probe_of(name: &str) -> Option<usize> {
        name.strip_prefix("probe")?.parse().ok()
    }
}

impl FitnessFunction for GradientProblem {
    fn evaluate(
        &mut self,
        individual: &Individual,
        _timeout_ms: u64,
    ) -> Result<Evaluation, EvalError> {
        let mut fitness = FitnessValue::new();
        let mut results = Vec::with_capacity(individual.actions.len());

        for (ai, action) in individual.actions.iter().enumerate() {
            if let Some(target) = Self::probe_of(&action.name) {
                if target < self.targets {
                    if let Some(Gene::Integer { value, .. }) = action.genes.first() {
                        let distance = (value - self.optimum(target)).abs();
                        let score =
                            (1.0 - distance as f64 / (self.range as f64 + 1.0)).max(0.001);
                        fitness
                            .set_heuristic(target as TargetId, score, ai)
                            .map_err(|e| EvalError::Fault { description: e.to_string() })?;
                    }
                }
            }
            results.push(ActionResult { action_index: ai, timed_out: false, fault: None });
        }

        Ok(Evaluation { fitness, results })
    }

    fn target_names(&self) -> BTreeMap<TargetId, String> {
        (0..self.targets as TargetId)
            .map(|t| (t, format!("probe_{}", t)))
            .collect()
    }
}

impl Sampler for GradientProblem {
    fn sample_random(&self, rng: &mut ChaCha8Rng) -> Individual {
        let mut ind = Individual::new();
        for target in 0..self.targets {
            ind.actions.push(Action {
                name: format!("probe{}", target),
                genes: vec![Gene::Integer {
                    value: rng.gen_range(0..=self.range),
                    min: 0,
                    max: self.range,
                }],
                creates: None,
                uses: None,
            });
        }
        ind
    }

    fn random_action(&self, rng: &mut ChaCha8Rng) -> Action {
        let target = rng.gen_range(0..self.targets);
        Action {
            name: format!("probe{}", target),
            genes: vec![Gene::Integer {
                value: rng.gen_range(0..=self.range),
                min: 0,
                max: self.range,
            }],
            creates: None,
            uses: None,
        }
    }
}
