use crate::fitness::{FitnessValue, TargetId, MAX_VALUE};
use crate::individual::EvaluatedIndividual;
use crate::param::FeedbackDirectedSampling;
use log::{debug, error};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

/// Final artifact of a search: a deduplicated set of evaluated individuals
/// whose union of reached targets equals everything the archive ever reached,
/// plus the element-wise best fitness across them.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct Solution {
    pub id: String,
    pub overall: FitnessValue,
    pub individuals: Vec<EvaluatedIndividual>,
}

impl Solution {
    pub fn number_of_covered_targets(&self) -> usize {
        self.overall.covered_targets().count()
    }

    pub fn summary(&self) -> String {
        format!(
            "Solution {}: {} individuals, {} targets reached, {} covered",
            self.id,
            self.individuals.len(),
            self.overall.view().len(),
            self.number_of_covered_targets()
        )
    }

    /// Save with format chosen by file extension (.json, .bin/.bincode)
    pub fn save_auto<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let ext = path
            .as_ref()
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "bin" | "bincode" => self.save_bincode(path),
            _ => self.save_json(path),
        }
    }

    fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let json = serde_json::to_string_pretty(self)?;
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(json.as_bytes())?;
        Ok(())
    }

    fn save_bincode<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let encoded = bincode::serialize(self)?;
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&encoded)?;
        Ok(())
    }

    pub fn load_auto<P: AsRef<std::path::Path>>(path: P) -> Result<Solution, Box<dyn Error>> {
        let ext = path
            .as_ref()
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let mut bytes = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
        let solution: Solution = match ext.as_str() {
            "bin" | "bincode" => bincode::deserialize(&bytes)?,
            _ => serde_json::from_slice(&bytes)?,
        };
        solution.overall.validate()?;
        Ok(solution)
    }
}

/// Per-target store of the best individuals seen so far, with the adaptive
/// sampling state driving feedback-directed search.
///
/// Owned exclusively by the search loop; monitors read defensive copies via
/// the snapshot accessors.
pub struct Archive {
    /// Per target, the stored individuals; within the regular case kept
    /// ascending, worst first. A covered target holds exactly one.
    populations: BTreeMap<TargetId, Vec<EvaluatedIndividual>>,
    /// Times a target was worked on without improvement since the last one
    sampling_counter: BTreeMap<TargetId, u32>,
    /// Counter value at which the previous improvement happened
    last_improvement: BTreeMap<TargetId, u32>,
    population_limit: usize,
    sampling: FeedbackDirectedSampling,
}

impl Archive {
    pub fn new(population_limit: usize, sampling: FeedbackDirectedSampling) -> Archive {
        Archive {
            populations: BTreeMap::new(),
            sampling_counter: BTreeMap::new(),
            last_improvement: BTreeMap::new(),
            population_limit: population_limit.max(1),
            sampling,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.populations.values().all(|p| p.is_empty())
    }

    pub fn is_covered(&self, target: TargetId) -> bool {
        match self.populations.get(&target) {
            Some(pop) => pop.len() == 1 && pop[0].fitness.does_cover(target),
            None => false,
        }
    }

    pub fn number_of_reached_targets(&self) -> usize {
        self.populations.iter().filter(|(_, p)| !p.is_empty()).count()
    }

    pub fn number_of_covered_targets(&self) -> usize {
        self.populations.keys().filter(|&&t| self.is_covered(t)).count()
    }

    pub fn not_covered_targets(&self) -> BTreeSet<TargetId> {
        self.populations
            .iter()
            .filter(|(t, p)| !p.is_empty() && !self.is_covered(**t))
            .map(|(t, _)| *t)
            .collect()
    }

    pub fn best_heuristic(&self, target: TargetId) -> Option<f64> {
        self.populations.get(&target).and_then(|pop| {
            pop.iter()
                .map(|e| e.fitness.heuristic(target))
                .reduce(f64::max)
        })
    }

    /// Targets for which `add_if_needed` would insert or improve this
    /// individual. Queried by the loop before the add so that impact
    /// bookkeeping can label the mutation outcome.
    pub fn improving_targets(&self, ei: &EvaluatedIndividual) -> BTreeSet<TargetId> {
        let mut improving = BTreeSet::new();
        if ei.fitness.validate().is_err() {
            return improving;
        }
        for target in ei.fitness.reached_targets() {
            let pop = match self.populations.get(&target) {
                None => {
                    improving.insert(target);
                    continue;
                }
                Some(pop) if pop.is_empty() => {
                    improving.insert(target);
                    continue;
                }
                Some(pop) => pop,
            };
            if self.is_covered(target) {
                let current = &pop[0];
                if ei.fitness.does_cover(target)
                    && (ei.size() < current.size()
                        || (ei.size() == current.size()
                            && ei.fitness.score() > current.fitness.score()))
                {
                    improving.insert(target);
                }
                continue;
            }
            if ei.fitness.does_cover(target) {
                improving.insert(target);
                continue;
            }
            let worst = pop
                .iter()
                .reduce(|worst, e| if worst.better_than(target, e) { e } else { worst })
                .unwrap();
            if ei.better_than(target, worst) {
                improving.insert(target);
            }
        }
        improving
    }

    /// Decide, for every target this individual reaches, whether it improves
    /// the frontier of known-best solutions, storing a copy where it does.
    ///
    /// Returns true iff at least one target was newly reached or improved.
    /// Non-improvement is the expected common case and only bumps the
    /// sampling counters; an invalid fitness or a broken action ordering is a
    /// programming error and rejects the whole add.
    pub fn add_if_needed(&mut self, ei: &EvaluatedIndividual) -> bool {
        if let Err(e) = ei.fitness.validate() {
            error!("Rejecting individual with invalid fitness: {}", e);
            return false;
        }
        if !ei.individual.verify_dependencies() {
            error!("Rejecting individual with broken action dependencies (hash {})", ei.individual.hash);
            return false;
        }

        let mut added = false;
        let touched: Vec<TargetId> = ei.fitness.reached_targets().collect();

        for target in touched {
            let score = ei.fitness.heuristic(target);
            let covered_before = self.is_covered(target);
            let limit = self.population_limit;
            let pop = self.populations.entry(target).or_default();

            // new target reached
            if pop.is_empty() {
                pop.push(ei.clone());
                added = true;
                self.report_improvement(target);
                continue;
            }

            // clone of an already stored test case
            if pop.iter().any(|e| e.individual.hash == ei.individual.hash) {
                self.bump_counter(target);
                continue;
            }

            let maxed = score >= MAX_VALUE;

            if covered_before && maxed {
                // collateral check: keep a covering test only if shorter, or
                // of equal length with more collateral coverage
                let current = &pop[0];
                let shorter = ei.size() < current.size();
                let same_length_better_score =
                    ei.size() == current.size() && ei.fitness.score() > current.fitness.score();
                if shorter || same_length_better_score {
                    pop[0] = ei.clone();
                    added = true;
                    self.report_improvement(target);
                } else {
                    self.bump_counter(target);
                }
                continue;
            }

            if maxed {
                // first full coverage: drop all partial solutions
                pop.clear();
                pop.push(ei.clone());
                added = true;
                self.report_improvement(target);
                continue;
            }

            if covered_before {
                // partial solution for an already covered target
                self.bump_counter(target);
                continue;
            }

            // regular case: population sorted ascending, worst at the front
            sort_ascending(pop, target);
            while pop.len() > limit {
                pop.remove(0);
            }

            let better = ei.better_than(target, &pop[0]);

            if pop.len() < limit {
                pop.push(ei.clone());
                added = true;
                if better {
                    self.report_improvement(target);
                } else {
                    self.bump_counter(target);
                }
                continue;
            }

            if better {
                pop[0] = ei.clone();
                added = true;
                self.report_improvement(target);
            } else {
                self.bump_counter(target);
            }
        }

        added
    }

    /// Draw a target and one of its stored individuals for mutation.
    ///
    /// Feedback-directed: prefer the not-yet-covered target that has waited
    /// the fewest samples since its last improvement, falling back to covered
    /// targets only once everything reached is covered. Among the stored
    /// individuals, ones that did not time out are preferred.
    pub fn sample(&mut self, rng: &mut ChaCha8Rng) -> Option<(TargetId, EvaluatedIndividual)> {
        let mut choose_from: Vec<TargetId> = self
            .not_covered_targets()
            .into_iter()
            .collect();
        if choose_from.is_empty() {
            choose_from = self
                .populations
                .iter()
                .filter(|(_, p)| !p.is_empty())
                .map(|(t, _)| *t)
                .collect();
        }
        if choose_from.is_empty() {
            return None;
        }

        let target = match self.sampling {
            FeedbackDirectedSampling::None => choose_from[rng.gen_range(0..choose_from.len())],
            FeedbackDirectedSampling::Last => *choose_from
                .iter()
                .min_by_key(|&&t| (self.sampling_counter.get(&t).copied().unwrap_or(0), t))
                .unwrap(),
        };

        self.bump_counter(target);

        let pop = &self.populations[&target];
        let not_timed_out: Vec<usize> = (0..pop.len()).filter(|&i| !pop[i].timed_out()).collect();
        let chosen = if not_timed_out.is_empty() {
            rng.gen_range(0..pop.len())
        } else {
            not_timed_out[rng.gen_range(0..not_timed_out.len())]
        };

        debug!(
            "Sampling target {} (counter {})",
            target,
            self.sampling_counter.get(&target).copied().unwrap_or(0)
        );

        Some((target, pop[chosen].clone()))
    }

    /// Compute the minimal set of stored individuals achieving, for every
    /// reached target, the best heuristic the archive holds for it. Greedy
    /// cover; ties broken by preferring individuals satisfying more targets,
    /// then shorter ones.
    pub fn extract_solution(&self) -> Solution {
        // best stored value per target, and the deduplicated candidates
        let mut best_value: BTreeMap<TargetId, f64> = BTreeMap::new();
        let mut candidates: Vec<&EvaluatedIndividual> = Vec::new();
        let mut seen = BTreeSet::new();
        for (&target, pop) in &self.populations {
            let best = match pop
                .iter()
                .reduce(|best, e| if e.better_than(target, best) { e } else { best })
            {
                Some(best) => best,
                None => continue,
            };
            best_value.insert(target, best.fitness.heuristic(target));
            if seen.insert(best.individual.hash) {
                candidates.push(best);
            }
        }

        let mut remaining: BTreeSet<TargetId> = best_value.keys().copied().collect();
        let mut selected: Vec<EvaluatedIndividual> = Vec::new();

        while !remaining.is_empty() && !candidates.is_empty() {
            let mut best_pos = 0;
            let mut best_gain = 0;
            for (pos, candidate) in candidates.iter().enumerate() {
                let gain = remaining
                    .iter()
                    .filter(|&&t| candidate.fitness.heuristic(t) >= best_value[&t])
                    .count();
                let better = gain > best_gain
                    || (gain == best_gain
                        && gain > 0
                        && candidate.size() < candidates[best_pos].size());
                if better {
                    best_pos = pos;
                    best_gain = gain;
                }
            }
            if best_gain == 0 {
                break;
            }
            let chosen = candidates.remove(best_pos);
            remaining.retain(|&t| chosen.fitness.heuristic(t) < best_value[&t]);
            selected.push(chosen.clone());
        }

        let mut overall = FitnessValue::new();
        for ei in &selected {
            overall.merge_max(&ei.fitness);
        }

        Solution {
            id: String::new(),
            overall,
            individuals: selected,
        }
    }

    /// Defensive copy of the stored populations, for monitoring only
    pub fn snapshot_of_best_individuals(&self) -> BTreeMap<TargetId, Vec<EvaluatedIndividual>> {
        self.populations.clone()
    }

    /// Defensive copy of the sampling counters, for monitoring only
    pub fn snapshot_of_sampling_counter(&self) -> BTreeMap<TargetId, u32> {
        self.sampling_counter.clone()
    }

    pub fn last_improvement_of(&self, target: TargetId) -> Option<u32> {
        self.last_improvement.get(&target).copied()
    }

    fn report_improvement(&mut self, target: TargetId) {
        let counter = self.sampling_counter.get(&target).copied().unwrap_or(0);
        self.last_improvement.insert(target, counter);
        self.sampling_counter.insert(target, 0);
    }

    fn bump_counter(&mut self, target: TargetId) {
        *self.sampling_counter.entry(target).or_insert(0) += 1;
    }
}

/// Ascending sort: the worst individual for the target ends up first.
/// Heuristic value, then extra heuristics, then preferring shorter tests.
fn sort_ascending(pop: &mut [EvaluatedIndividual], target: TargetId) {
    pop.sort_by(|a, b| {
        if a.better_than(target, b) {
            Ordering::Greater
        } else if b.better_than(target, a) {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gene::Gene;
    use crate::individual::{Action, Individual};
    use rand::SeedableRng;

    fn individual(n_actions: usize, tag: i64) -> Individual {
        let mut ind = Individual::new();
        for i in 0..n_actions {
            ind.actions.push(Action {
                name: format!("a{}", i),
                genes: vec![Gene::Integer { value: tag + i as i64, min: 0, max: 1_000_000 }],
                creates: None,
                uses: None,
            });
        }
        ind.compute_hash();
        ind
    }

    fn evaluated(n_actions: usize, tag: i64, targets: &[(TargetId, f64)]) -> EvaluatedIndividual {
        let mut fitness = FitnessValue::new();
        for (t, s) in targets {
            fitness.set_heuristic(*t, *s, 0).unwrap();
        }
        EvaluatedIndividual::new(individual(n_actions, tag), fitness, vec![])
    }

    #[test]
    fn test_add_new_target_inserts() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        assert!(archive.add_if_needed(&evaluated(2, 0, &[(0, 0.5)])));
        assert_eq!(archive.number_of_reached_targets(), 1);
        assert_eq!(archive.best_heuristic(0), Some(0.5));
    }

    #[test]
    fn test_monotonicity_best_never_regresses() {
        let mut archive = Archive::new(3, FeedbackDirectedSampling::Last);
        let sequence = [0.4, 0.2, 0.9, 0.1, 0.9, 1.0, 0.3];
        let mut best = 0.0;
        for (i, s) in sequence.iter().enumerate() {
            archive.add_if_needed(&evaluated(2, 100 + i as i64, &[(7, *s)]));
            let stored = archive.best_heuristic(7).unwrap();
            assert!(stored >= best, "best regressed: {} < {}", stored, best);
            best = stored;
        }
        assert_eq!(best, 1.0);
    }

    #[test]
    fn test_covered_target_shrinks_to_one() {
        let mut archive = Archive::new(5, FeedbackDirectedSampling::Last);
        archive.add_if_needed(&evaluated(3, 1, &[(0, 0.3)]));
        archive.add_if_needed(&evaluated(3, 2, &[(0, 0.6)]));
        archive.add_if_needed(&evaluated(3, 3, &[(0, 1.0)]));
        let snapshot = archive.snapshot_of_best_individuals();
        assert_eq!(snapshot[&0].len(), 1);
        assert!(archive.is_covered(0));

        // further partial solutions do not get stored
        assert!(!archive.add_if_needed(&evaluated(3, 4, &[(0, 0.9)])));
        assert_eq!(archive.snapshot_of_best_individuals()[&0].len(), 1);
    }

    #[test]
    fn test_scenario_b_non_redundancy() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        archive.add_if_needed(&evaluated(1, 1, &[(0, 1.0)]));
        archive.add_if_needed(&evaluated(1, 2, &[(1, 0.5)]));
        let solution = archive.extract_solution();
        assert_eq!(solution.individuals.len(), 2);
        assert_eq!(solution.overall.heuristic(0), 1.0);
        assert_eq!(solution.overall.heuristic(1), 0.5);
    }

    #[test]
    fn test_scenario_c_redundant_optimum_rejected() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        assert!(archive.add_if_needed(&evaluated(2, 1, &[(0, 1.0)])));
        // different individual, same coverage, same length, no better score
        assert!(!archive.add_if_needed(&evaluated(2, 2, &[(0, 1.0)])));
        assert_eq!(archive.snapshot_of_best_individuals()[&0].len(), 1);
    }

    #[test]
    fn test_covered_replacement_prefers_shorter() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        archive.add_if_needed(&evaluated(4, 1, &[(0, 1.0)]));
        assert!(archive.add_if_needed(&evaluated(2, 2, &[(0, 1.0)])));
        let snapshot = archive.snapshot_of_best_individuals();
        assert_eq!(snapshot[&0].len(), 1);
        assert_eq!(snapshot[&0][0].size(), 2);
    }

    #[test]
    fn test_idempotent_no_op_readd() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        let ei = evaluated(2, 1, &[(0, 1.0), (1, 0.4)]);
        assert!(archive.add_if_needed(&ei));
        let pops_before = archive.snapshot_of_best_individuals();
        let counters_before = archive.snapshot_of_sampling_counter();

        assert!(!archive.add_if_needed(&ei));

        assert_eq!(archive.snapshot_of_best_individuals(), pops_before);
        let counters_after = archive.snapshot_of_sampling_counter();
        for (t, c) in counters_after {
            assert_eq!(c, counters_before.get(&t).copied().unwrap_or(0) + 1);
        }
    }

    #[test]
    fn test_invalid_fitness_rejected_entirely() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        let ei = evaluated(1, 1, &[(0, 0.5)]);
        // corrupt the stored value behind the constructor's checks
        let mut bad = ei.clone();
        bad.fitness = serde_json::from_str(
            &serde_json::to_string(&ei.fitness)
                .unwrap()
                .replace("0.5", "1.7"),
        )
        .unwrap();
        assert!(!archive.add_if_needed(&bad));
        assert!(archive.is_empty());
    }

    #[test]
    fn test_broken_dependencies_rejected() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        let mut ei = evaluated(1, 1, &[(0, 0.5)]);
        ei.individual.actions[0].uses = Some(9);
        assert!(!archive.add_if_needed(&ei));
        assert!(archive.is_empty());
    }

    #[test]
    fn test_improving_targets_matches_add() {
        let mut archive = Archive::new(1, FeedbackDirectedSampling::Last);
        archive.add_if_needed(&evaluated(2, 1, &[(0, 0.5)]));

        let better = evaluated(2, 2, &[(0, 0.8), (3, 0.1)]);
        let improving = archive.improving_targets(&better);
        assert!(improving.contains(&0));
        assert!(improving.contains(&3));

        let worse = evaluated(2, 3, &[(0, 0.2)]);
        assert!(archive.improving_targets(&worse).is_empty());
    }

    #[test]
    fn test_feedback_sampling_prefers_recently_improved() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        archive.add_if_needed(&evaluated(1, 1, &[(0, 0.5)]));
        archive.add_if_needed(&evaluated(1, 2, &[(1, 0.5)]));

        // starve target 0: repeated non-improving adds touching it
        for i in 0..5 {
            archive.add_if_needed(&evaluated(1, 10 + i, &[(0, 0.1)]));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let (target, _) = archive.sample(&mut rng).unwrap();
        assert_eq!(target, 1);
    }

    #[test]
    fn test_sample_prefers_not_timed_out() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        let mut slow = evaluated(1, 1, &[(0, 0.5)]);
        slow.results.push(crate::individual::ActionResult {
            action_index: 0,
            timed_out: true,
            fault: None,
        });
        let fast = evaluated(1, 2, &[(0, 0.4)]);
        archive.add_if_needed(&slow);
        archive.add_if_needed(&fast);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..10 {
            let (_, ei) = archive.sample(&mut rng).unwrap();
            assert!(!ei.timed_out());
        }
    }

    #[test]
    fn test_population_bounded_by_limit() {
        let mut archive = Archive::new(2, FeedbackDirectedSampling::Last);
        for i in 0..10 {
            archive.add_if_needed(&evaluated(1, i, &[(0, 0.1 + 0.05 * i as f64)]));
        }
        assert!(archive.snapshot_of_best_individuals()[&0].len() <= 2);
        assert!((archive.best_heuristic(0).unwrap() - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_solution_save_load_roundtrip() {
        let mut archive = Archive::new(10, FeedbackDirectedSampling::Last);
        archive.add_if_needed(&evaluated(1, 1, &[(0, 1.0)]));
        let mut solution = archive.extract_solution();
        solution.id = "roundtrip".to_string();

        let dir = std::env::temp_dir();
        let json_path = dir.join("miosearch_solution_test.json");
        let bin_path = dir.join("miosearch_solution_test.bin");

        solution.save_auto(&json_path).unwrap();
        let loaded = Solution::load_auto(&json_path).unwrap();
        assert_eq!(loaded, solution);

        solution.save_auto(&bin_path).unwrap();
        let loaded = Solution::load_auto(&bin_path).unwrap();
        assert_eq!(loaded, solution);

        std::fs::remove_file(json_path).unwrap();
        std::fs::remove_file(bin_path).unwrap();
    }
}
