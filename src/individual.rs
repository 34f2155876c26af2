use crate::fitness::{FitnessValue, TargetId};
use crate::gene::Gene;
use crate::impact::ImpactsOfIndividual;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Identifier linking an action that creates a resource to later actions
/// using it (e.g. a POST creating an entity later read by a GET).
pub type ResourceId = u32;

/// One call against the system under test: a named operation plus its input
/// genes and optional resource dependencies.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct Action {
    pub name: String,
    pub genes: Vec<Gene>,
    /// Resource this action makes available to later actions
    pub creates: Option<ResourceId>,
    /// Resource this action requires from an earlier action
    pub uses: Option<ResourceId>,
}

/// One candidate test case: an ordered sequence of actions. The gene trees of
/// the actions are the mutable search space.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct Individual {
    pub actions: Vec<Action>,
    /// Identifier hash of the test case, derived from its structure and values
    pub hash: u64,
}

impl Individual {
    pub fn new() -> Individual {
        Individual {
            actions: Vec::new(),
            hash: 0,
        }
    }

    /// Number of actions; the secondary "shorter test" criterion
    pub fn size(&self) -> usize {
        self.actions.len()
    }

    pub fn compute_hash(&mut self) {
        let mut hasher = DefaultHasher::new();
        hasher.write_usize(self.actions.len());
        for action in &self.actions {
            hasher.write(action.name.as_bytes());
            for gene in &action.genes {
                gene.feed_hash(&mut hasher);
            }
        }
        self.hash = hasher.finish();
    }

    /// Every `uses` must be satisfied by a `creates` on an earlier action.
    /// Structural mutation must never publish an individual violating this.
    pub fn verify_dependencies(&self) -> bool {
        let mut available: Vec<ResourceId> = Vec::new();
        for action in &self.actions {
            if let Some(required) = action.uses {
                if !available.contains(&required) {
                    return false;
                }
            }
            if let Some(created) = action.creates {
                available.push(created);
            }
        }
        true
    }

    /// Indices of actions whose removal keeps every dependency satisfied
    pub fn removable_actions(&self) -> Vec<usize> {
        (0..self.actions.len())
            .filter(|&i| {
                if self.actions[i].creates.is_none() {
                    return true;
                }
                let mut candidate = self.clone();
                candidate.actions.remove(i);
                candidate.verify_dependencies()
            })
            .collect()
    }

    pub fn gene_mut(&mut self, action_index: usize, gene_index: usize) -> Option<&mut Gene> {
        self.actions.get_mut(action_index)?.genes.get_mut(gene_index)
    }
}

/// Outcome of executing one action during fitness evaluation
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct ActionResult {
    pub action_index: usize,
    pub timed_out: bool,
    pub fault: Option<String>,
}

/// Ownership pairing of one individual with its fitness and raw execution
/// results, plus the impact statistics of its lineage. This is the unit the
/// archive stores and the search loop mutates copies of.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct EvaluatedIndividual {
    pub individual: Individual,
    pub fitness: FitnessValue,
    pub results: Vec<ActionResult>,
    pub impacts: ImpactsOfIndividual,
}

impl EvaluatedIndividual {
    pub fn new(
        mut individual: Individual,
        fitness: FitnessValue,
        results: Vec<ActionResult>,
    ) -> EvaluatedIndividual {
        if individual.hash == 0 {
            individual.compute_hash();
        }
        let impacts = ImpactsOfIndividual::from_individual(&individual);
        EvaluatedIndividual {
            individual,
            fitness,
            results,
            impacts,
        }
    }

    /// Pairing that keeps the impact statistics of an existing lineage
    /// instead of starting fresh ones
    pub fn with_impacts(
        mut individual: Individual,
        fitness: FitnessValue,
        results: Vec<ActionResult>,
        impacts: ImpactsOfIndividual,
    ) -> EvaluatedIndividual {
        if individual.hash == 0 {
            individual.compute_hash();
        }
        EvaluatedIndividual {
            individual,
            fitness,
            results,
            impacts,
        }
    }

    pub fn size(&self) -> usize {
        self.individual.size()
    }

    pub fn timed_out(&self) -> bool {
        self.results.iter().any(|r| r.timed_out)
    }

    pub fn better_than(&self, target: TargetId, other: &EvaluatedIndividual) -> bool {
        self.fitness
            .better_than(target, &other.fitness, self.size(), other.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn action(name: &str, creates: Option<ResourceId>, uses: Option<ResourceId>) -> Action {
        Action {
            name: name.to_string(),
            genes: vec![Gene::Boolean { value: false }],
            creates,
            uses,
        }
    }

    #[test]
    fn test_verify_dependencies() {
        let mut ind = Individual::new();
        ind.actions.push(action("create", Some(1), None));
        ind.actions.push(action("use", None, Some(1)));
        assert!(ind.verify_dependencies());

        ind.actions.swap(0, 1);
        assert!(!ind.verify_dependencies());
    }

    #[test]
    fn test_removable_actions_protect_providers() {
        let mut ind = Individual::new();
        ind.actions.push(action("create", Some(1), None));
        ind.actions.push(action("other", None, None));
        ind.actions.push(action("use", None, Some(1)));
        let removable = ind.removable_actions();
        assert!(!removable.contains(&0));
        assert!(removable.contains(&1));
        assert!(removable.contains(&2));
    }

    #[test]
    fn test_hash_changes_with_values() {
        let mut a = Individual::new();
        a.actions.push(action("x", None, None));
        a.compute_hash();
        let mut b = a.clone();
        if let Some(Gene::Boolean { value }) = b.gene_mut(0, 0) {
            *value = true;
        }
        b.compute_hash();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_timed_out_flag() {
        let mut ind = Individual::new();
        ind.actions.push(action("x", None, None));
        let ei = EvaluatedIndividual::new(
            ind,
            FitnessValue::new(),
            vec![ActionResult { action_index: 0, timed_out: true, fault: None }],
        );
        assert!(ei.timed_out());
    }
}
