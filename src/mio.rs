use crate::archive::{Archive, Solution};
use crate::eval::{EvalError, FitnessFunction, ResponseHarvester, Sampler};
use crate::fitness::TargetId;
use crate::impact::ImpactsOfIndividual;
use crate::individual::EvaluatedIndividual;
use crate::monitor::SearchMonitor;
use crate::mutator::{record_mutation_outcomes, Mutator};
use crate::param::Param;
use crate::utils::annealed_value;
use log::{debug, error, info, warn};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

//-----------------------------------------------------------------------------
// MIO search loop
//-----------------------------------------------------------------------------

/// Phase of the search; exploration parameters decay during the first phase
/// and stay at their final values once focused search starts.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum SearchPhase {
    InitialRandomSampling,
    FocusedSearch,
    Terminated,
}

impl SearchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchPhase::InitialRandomSampling => "random-sampling",
            SearchPhase::FocusedSearch => "focused-search",
            SearchPhase::Terminated => "terminated",
        }
    }
}

/// Run-terminating failure: the controller or system under test became
/// unreachable. Carries whatever the archive had achieved so far.
#[derive(Debug)]
pub struct SearchError {
    pub description: String,
    pub partial: Solution,
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "search halted on infrastructure fault: {}", self.description)
    }
}

impl std::error::Error for SearchError {}

/// Main search loop: sample or mutate, evaluate, feed the archive and the
/// impact statistics, until the budget is exhausted.
///
/// # Arguments
///
/// * `ff` - The external fitness collaborator.
/// * `sampler` - Source of fresh random individuals and the action repertoire.
/// * `harvester` - Best-effort store of harvested external responses.
/// * `param` - Search parameters.
/// * `monitor` - Trajectory recorder, written between iterations only.
/// * `running` - Atomic boolean cleared by signal handlers to stop the run.
///
/// # Returns
///
/// The extracted solution, or a `SearchError` with a partial solution when an
/// infrastructure fault halts the run.
pub fn mio<F: FitnessFunction, S: Sampler>(
    ff: &mut F,
    sampler: &S,
    harvester: &dyn ResponseHarvester,
    param: &Param,
    monitor: &mut SearchMonitor,
    running: Arc<AtomicBool>,
) -> Result<Solution, SearchError> {
    let time = Instant::now();
    let mut rng = ChaCha8Rng::seed_from_u64(param.general.seed);
    let mut archive = Archive::new(
        param.mio.population_size,
        param.mio.feedback_directed_sampling.clone(),
    );
    let mutator = Mutator::new(param, harvester);

    let mut evaluations: u64 = 0;
    let mut phase = SearchPhase::InitialRandomSampling;

    info!(
        "Starting MIO search: budget {} evaluations{}, seed {}",
        param.general.max_evaluations,
        if param.general.max_seconds > 0 {
            format!(" / {} seconds", param.general.max_seconds)
        } else {
            String::new()
        },
        param.general.seed
    );

    loop {
        // cancellation and budget checked at iteration granularity so the
        // archive and impact trees are never left half-updated
        if !running.load(Ordering::Relaxed) {
            info!("Signal received, stopping search");
            break;
        }
        if budget_exhausted(evaluations, &time, param) {
            info!("Budget exhausted after {} evaluations", evaluations);
            break;
        }

        let consumed = consumed_fraction(evaluations, &time, param);
        if phase == SearchPhase::InitialRandomSampling
            && consumed >= param.mio.focused_search_fraction
        {
            phase = SearchPhase::FocusedSearch;
            info!(
                "Focused search activated at {:.0}% of budget ({} evaluations)",
                consumed * 100.0,
                evaluations
            );
        }

        let p_random = annealed_value(
            param.mio.probability_random_sampling,
            0.0,
            consumed,
            param.mio.focused_search_fraction,
        );

        let from_archive = !archive.is_empty() && !rng.gen_bool(p_random.clamp(0.0, 1.0));

        let (mut individual, impacts, parent_fitness, spec) = if from_archive {
            let (target, parent) = match archive.sample(&mut rng) {
                Some(drawn) => drawn,
                None => continue,
            };
            debug!("Mutating individual drawn for target {}", target);
            let mut individual = parent.individual.clone();
            let mut impacts = parent.impacts.clone();
            let relevant: BTreeSet<TargetId> = archive.not_covered_targets();
            let mutations = annealed_value(
                param.mio.max_mutations as f64,
                1.0,
                consumed,
                param.mio.focused_search_fraction,
            )
            .round()
            .max(1.0) as usize;
            let spec = mutator.mutate(
                &mut individual,
                &mut impacts,
                sampler,
                &relevant,
                mutations,
                &mut rng,
            );
            (individual, impacts, Some(parent.fitness), Some(spec))
        } else {
            let individual = sampler.sample_random(&mut rng);
            let impacts = ImpactsOfIndividual::from_individual(&individual);
            (individual, impacts, None, None)
        };
        individual.compute_hash();

        // the one blocking point of the iteration
        let evaluation = match ff.evaluate(&individual, param.execution.action_timeout_ms) {
            Ok(evaluation) => evaluation,
            Err(EvalError::Fault { description }) => {
                // evaluators normally fold faults into fitness; absorb the
                // exception as a burnt evaluation
                warn!("Evaluation fault absorbed: {}", description);
                evaluations += 1;
                continue;
            }
            Err(EvalError::Infrastructure { description }) => {
                error!("Infrastructure fault, halting search: {}", description);
                let mut partial = archive.extract_solution();
                partial.id = "partial".to_string();
                return Err(SearchError { description, partial });
            }
        };
        evaluations += 1;

        let mut evaluated = EvaluatedIndividual::with_impacts(
            individual,
            evaluation.fitness,
            evaluation.results,
            impacts,
        );
        if !evaluated.fitness.faults.is_empty() {
            debug!(
                "{} fault markers on evaluated individual {}",
                evaluated.fitness.faults.len(),
                evaluated.individual.hash
            );
        }

        // label the mutation outcome against the pre-add archive state
        let improved_targets = archive.improving_targets(&evaluated);
        if let (Some(parent_fitness), Some(spec)) = (&parent_fitness, &spec) {
            let touched: BTreeSet<TargetId> = evaluated.fitness.reached_targets().collect();
            let impacted: BTreeSet<TargetId> = touched
                .iter()
                .copied()
                .filter(|t| evaluated.fitness.heuristic(*t) != parent_fitness.heuristic(*t))
                .collect();
            record_mutation_outcomes(
                &mut evaluated.impacts,
                spec,
                &touched,
                &impacted,
                &improved_targets,
            );
            mutator.evaluate_mutation(
                spec,
                &evaluated.individual,
                &mut evaluated.impacts,
                !improved_targets.is_empty(),
            );
        }

        let added = archive.add_if_needed(&evaluated);
        monitor.record(evaluations, &archive, added, phase.as_str());
    }

    phase = SearchPhase::Terminated;
    debug!("Search loop left in phase {}", phase.as_str());

    let solution = archive.extract_solution();
    info!(
        "MIO search finished in {:.2?}: {} evaluations, {} targets reached, {} covered, {} individuals in solution",
        time.elapsed(),
        evaluations,
        archive.number_of_reached_targets(),
        archive.number_of_covered_targets(),
        solution.individuals.len()
    );

    Ok(solution)
}

fn budget_exhausted(evaluations: u64, time: &Instant, param: &Param) -> bool {
    if param.general.max_evaluations > 0 && evaluations >= param.general.max_evaluations {
        return true;
    }
    if param.general.max_seconds > 0 && time.elapsed().as_secs() >= param.general.max_seconds {
        return true;
    }
    false
}

/// Fraction of the budget consumed, in [0,1]; with both budgets set, the one
/// closest to exhaustion rules
fn consumed_fraction(evaluations: u64, time: &Instant, param: &Param) -> f64 {
    let mut consumed: f64 = 0.0;
    if param.general.max_evaluations > 0 {
        consumed = consumed.max(evaluations as f64 / param.general.max_evaluations as f64);
    }
    if param.general.max_seconds > 0 {
        consumed = consumed.max(time.elapsed().as_secs_f64() / param.general.max_seconds as f64);
    }
    consumed.min(1.0)
}
