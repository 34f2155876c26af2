use crate::eval::{ResponseHarvester, Sampler};
use crate::fitness::TargetId;
use crate::gene::{char_max, char_min, random_char, Gene};
use crate::impact::{GeneImpact, ImpactsOfIndividual};
use crate::individual::Individual;
use crate::param::{CharPool, GeneSelectionMethod, Param};
use crate::utils::weighted_sample_distinct;
use log::{debug, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Probability of mutating an array's size instead of one of its elements
const PROB_SIZE_MUTATION: f64 = 0.3;
/// Probability of following the boundary guidance instead of escaping it
const WITHIN_NORMAL: f64 = 0.9;
/// Probability of a char mutation over a length mutation for text genes
const PROB_MUTATE_CHAR: f64 = 0.8;
/// Probability of substituting a harvested real response into a text gene
const PROB_HARVESTED_RESPONSE: f64 = 0.1;
/// Weight multiplier for genes whose relevant targets are all exhausted
const EXHAUSTED_PENALTY: f64 = 0.1;

//-----------------------------------------------------------------------------
// Mutation boundaries
//-----------------------------------------------------------------------------

/// Shrinking candidate interval for a scalar value, updated from mutation
/// outcomes: an improvement pulls the far bound toward the midpoint of the
/// move, a regression pulls the near one. Once `prefer_min` and `prefer_max`
/// meet (within `granularity`) the interval is `reached` and no longer
/// shrinks until externally reset.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct MutationBoundary {
    pub prefer_min: f64,
    pub prefer_max: f64,
    pub granularity: f64,
    pub counter: u32,
    pub reached: bool,
}

impl MutationBoundary {
    pub fn new(min: f64, max: f64, granularity: f64) -> MutationBoundary {
        MutationBoundary {
            prefer_min: min,
            prefer_max: max,
            granularity,
            counter: 0,
            reached: (max - min) < granularity,
        }
    }

    pub fn width(&self) -> f64 {
        self.prefer_max - self.prefer_min
    }

    pub fn preferred(&self) -> f64 {
        (self.prefer_min + self.prefer_max) / 2.0
    }

    /// Feed back the outcome of one mutation from `previous` to `current`
    pub fn update(&mut self, previous: f64, current: f64, improved: bool) {
        if self.reached || current == previous {
            return;
        }
        self.counter += 1;
        let mid = (previous + current) / 2.0;
        let moved_up = current > previous;
        if improved == moved_up {
            // the optimum lies above the midpoint of the move
            self.prefer_min = self.prefer_min.max(mid.min(self.prefer_max));
        } else {
            self.prefer_max = self.prefer_max.min(mid.max(self.prefer_min));
        }
        if self.width() < self.granularity {
            self.reached = true;
        }
    }

    /// Integer candidate within the preferred interval, different from
    /// `current`; midpoint-biased. None when no such candidate exists.
    pub fn sample_int(&self, current: i64, rng: &mut ChaCha8Rng) -> Option<i64> {
        let lo = self.prefer_min.ceil() as i64;
        let hi = self.prefer_max.floor() as i64;
        if lo >= hi {
            return (lo == hi && lo != current).then_some(lo);
        }
        let mid = lo + (hi - lo) / 2;
        if rng.gen_bool(0.5) && mid != current {
            return Some(mid);
        }
        for _ in 0..16 {
            let v = rng.gen_range(lo..=hi);
            if v != current {
                return Some(v);
            }
        }
        (lo..=hi).find(|v| *v != current)
    }

    /// Continuous candidate within the preferred interval
    pub fn sample_f64(&self, current: f64, rng: &mut ChaCha8Rng) -> Option<f64> {
        if self.width() <= 0.0 {
            return None;
        }
        for _ in 0..16 {
            let v = if rng.gen_bool(0.5) {
                let quarter = self.width() / 4.0;
                rng.gen_range((self.prefer_min + quarter)..=(self.prefer_max - quarter))
            } else {
                rng.gen_range(self.prefer_min..=self.prefer_max)
            };
            if v != current {
                return Some(v);
            }
        }
        None
    }
}

/// Boundary state attached to a gene's impact record
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub enum GeneBoundary {
    Numeric(MutationBoundary),
    Text {
        length: MutationBoundary,
        chars: Vec<MutationBoundary>,
    },
}

impl GeneBoundary {
    pub fn for_gene(gene: &Gene) -> Option<GeneBoundary> {
        match gene {
            Gene::Boolean { .. } => Some(GeneBoundary::Numeric(MutationBoundary::new(0.0, 1.0, 1.0))),
            Gene::Integer { min, max, .. } => Some(GeneBoundary::Numeric(MutationBoundary::new(
                *min as f64,
                *max as f64,
                1.0,
            ))),
            Gene::Double { min, max, .. } => {
                let granularity = ((max - min).abs() * 1e-6).max(f64::MIN_POSITIVE);
                Some(GeneBoundary::Numeric(MutationBoundary::new(*min, *max, granularity)))
            }
            Gene::Text { min_len, max_len, .. } => Some(GeneBoundary::Text {
                length: MutationBoundary::new(*min_len as f64, *max_len as f64, 1.0),
                // char boundaries are created lazily once the pool is known
                chars: Vec::new(),
            }),
            _ => None,
        }
    }
}

//-----------------------------------------------------------------------------
// Mutation bookkeeping
//-----------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub enum MutationKind {
    /// A leaf value changed
    Value,
    /// An array grew or shrank
    Size,
}

/// One applied gene mutation: where it happened and the pre-mutation state
/// of the whole top-level gene, kept so the outcome can be evaluated once
/// the new fitness is known.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct MutatedGene {
    pub action_index: usize,
    pub gene_index: usize,
    /// Child indices from the top-level gene down to the mutated node
    pub path: Vec<usize>,
    pub previous: Gene,
    pub kind: MutationKind,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct MutationSpec {
    pub genes: Vec<MutatedGene>,
    /// Whether the action sequence itself was changed
    pub structure: bool,
}

//-----------------------------------------------------------------------------
// Mutator
//-----------------------------------------------------------------------------

/// Applies a bounded number of gene-level or structural changes to an
/// individual, guided by the impact statistics of its lineage.
pub struct Mutator<'a> {
    param: &'a Param,
    harvester: &'a dyn ResponseHarvester,
}

impl<'a> Mutator<'a> {
    pub fn new(param: &'a Param, harvester: &'a dyn ResponseHarvester) -> Mutator<'a> {
        Mutator { param, harvester }
    }

    /// Mutate `individual` in place, changing up to `budget` genes, or with
    /// the configured probability its action sequence instead. The returned
    /// spec records every change for impact and boundary feedback.
    pub fn mutate(
        &self,
        individual: &mut Individual,
        impacts: &mut ImpactsOfIndividual,
        sampler: &dyn Sampler,
        targets: &BTreeSet<TargetId>,
        budget: usize,
        rng: &mut ChaCha8Rng,
    ) -> MutationSpec {
        let structural = individual.actions.is_empty()
            || rng.gen_bool(self.param.mutation.structure_mutation_probability);
        if structural {
            return self.mutate_structure(individual, impacts, sampler, rng);
        }

        let slots: Vec<(usize, usize)> = individual
            .actions
            .iter()
            .enumerate()
            .flat_map(|(ai, a)| (0..a.genes.len()).map(move |gi| (ai, gi)))
            .collect();
        if slots.is_empty() {
            return self.mutate_structure(individual, impacts, sampler, rng);
        }

        let weights: Vec<f64> = slots
            .iter()
            .map(|(ai, gi)| match impacts.actions.get(*ai).and_then(|a| a.get(*gi)) {
                Some(node) => self.impact_weight(node, targets),
                None => 1.0,
            })
            .collect();
        let chosen = weighted_sample_distinct(&weights, budget.max(1), rng);

        let mut spec = MutationSpec::default();
        for slot in chosen {
            let (ai, gi) = slots[slot];
            let action_name = individual.actions[ai].name.clone();
            let previous = individual.actions[ai].genes[gi].clone();
            let gene = match individual.gene_mut(ai, gi) {
                Some(g) => g,
                None => continue,
            };
            let impact = match impacts.gene_impact_mut(ai, gi) {
                Some(node) => node,
                None => {
                    warn!("Impact shadow out of sync at action {} gene {}; skipping mutation", ai, gi);
                    continue;
                }
            };
            let mut path = Vec::new();
            let kind = self.mutate_gene_node(gene, impact, targets, &action_name, &mut path, rng);
            spec.genes.push(MutatedGene {
                action_index: ai,
                gene_index: gi,
                path,
                previous,
                kind,
            });
        }
        spec
    }

    /// Weight of one gene for selection: impact ratio on the relevant
    /// targets, never-manipulated genes kept attractive, exhausted ones
    /// pushed to the back.
    fn impact_weight(&self, impact: &GeneImpact, targets: &BTreeSet<TargetId>) -> f64 {
        match self.param.mutation.gene_selection {
            GeneSelectionMethod::Random => 1.0,
            GeneSelectionMethod::ApproachImpact => {
                let ratio = impact.counters.impact_ratio(targets);
                let mut weight = if ratio < 0.0 { 1.0 } else { 0.1 + ratio };
                if impact
                    .counters
                    .exhausted(targets, self.param.mutation.exhaustion_threshold)
                {
                    weight *= EXHAUSTED_PENALTY;
                }
                weight
            }
        }
    }

    fn mutate_gene_node(
        &self,
        gene: &mut Gene,
        impact: &mut GeneImpact,
        targets: &BTreeSet<TargetId>,
        action_name: &str,
        path: &mut Vec<usize>,
        rng: &mut ChaCha8Rng,
    ) -> MutationKind {
        if !gene.is_composite() {
            self.mutate_leaf(gene, impact, action_name, rng);
            return MutationKind::Value;
        }

        // array size mutation, tracked apart from element values
        let mut size_mutated = false;
        if let Gene::Array { elements, template, min_size, max_size } = &mut *gene {
            let can_grow = elements.len() < *max_size;
            let can_shrink = elements.len() > *min_size && !elements.is_empty();
            if (can_grow || can_shrink)
                && (elements.is_empty() || rng.gen_bool(PROB_SIZE_MUTATION))
            {
                if can_grow && (!can_shrink || rng.gen_bool(0.5)) {
                    let mut element = (**template).clone();
                    element.randomize(&self.param.mutation.char_pool, rng);
                    elements.push(element);
                } else {
                    let removed = rng.gen_range(0..elements.len());
                    elements.remove(removed);
                    if removed < impact.children.len() {
                        impact.children.remove(removed);
                    }
                }
                size_mutated = true;
            }
        }
        if size_mutated {
            impact.sync_children(gene);
            return MutationKind::Size;
        }

        let n = gene.child_count();
        if n == 0 {
            debug!("Composite gene without children selected for mutation; no-op");
            return MutationKind::Value;
        }
        let weights: Vec<f64> = (0..n)
            .map(|i| self.impact_weight(&impact.children[i], targets))
            .collect();
        let child = weighted_sample_distinct(&weights, 1, rng)[0];
        path.push(child);
        let child_impact = &mut impact.children[child];
        let child_gene = gene.child_mut(child).unwrap();
        self.mutate_gene_node(child_gene, child_impact, targets, action_name, path, rng)
    }

    fn mutate_leaf(
        &self,
        gene: &mut Gene,
        impact: &mut GeneImpact,
        action_name: &str,
        rng: &mut ChaCha8Rng,
    ) {
        let archive = self.param.mutation.archive_mutation;
        match gene {
            Gene::Boolean { value } => {
                if archive {
                    if let Some(GeneBoundary::Numeric(b)) = &impact.boundary {
                        if b.reached {
                            // one branch is known productive: stay on it
                            *value = b.preferred() >= 0.5;
                            return;
                        }
                    }
                }
                *value = !*value;
            }
            Gene::Integer { value, min, max } => {
                if *min >= *max {
                    return;
                }
                let guided = if archive {
                    match &impact.boundary {
                        Some(GeneBoundary::Numeric(b)) if !b.reached => b.sample_int(*value, rng),
                        _ => None,
                    }
                } else {
                    None
                };
                *value = guided.unwrap_or_else(|| standard_int(*value, *min, *max, rng));
            }
            Gene::Double { value, min, max } => {
                if *min >= *max {
                    return;
                }
                let guided = if archive {
                    match &impact.boundary {
                        Some(GeneBoundary::Numeric(b)) if !b.reached => b.sample_f64(*value, rng),
                        _ => None,
                    }
                } else {
                    None
                };
                *value = guided.unwrap_or_else(|| standard_double(*value, *min, *max, rng));
            }
            Gene::Enumeration { index, variants } => {
                if variants.len() > 1 {
                    let mut next = rng.gen_range(0..variants.len() - 1);
                    if next >= *index {
                        next += 1;
                    }
                    *index = next;
                }
            }
            Gene::Text { value, min_len, max_len } => {
                let boundary = match &mut impact.boundary {
                    Some(GeneBoundary::Text { length, chars }) => Some((length, chars)),
                    _ => None,
                };
                self.mutate_text(value, *min_len, *max_len, boundary, action_name, rng);
            }
            Gene::Object { .. } | Gene::Array { .. } => {
                debug!("Composite gene reached leaf mutation; no-op");
            }
        }
    }

    fn mutate_text(
        &self,
        value: &mut String,
        min_len: usize,
        max_len: usize,
        boundary: Option<(&mut MutationBoundary, &mut Vec<MutationBoundary>)>,
        action_name: &str,
        rng: &mut ChaCha8Rng,
    ) {
        let pool = &self.param.mutation.char_pool;

        // best-effort substitution of a harvested real response
        if rng.gen_bool(PROB_HARVESTED_RESPONSE) {
            if let Some(response) = self.harvester.get_copy_of_actual_response(action_name) {
                if !response.is_empty() && response != *value {
                    *value = response.chars().take(max_len).collect();
                    if let Some((_, chars)) = boundary {
                        sync_char_boundaries(chars, value.chars().count(), pool);
                    }
                    return;
                }
            }
        }

        let mut chars: Vec<char> = value.chars().collect();

        let (length_b, chars_b) = match boundary {
            Some((length, char_bounds)) if self.param.mutation.archive_mutation => {
                sync_char_boundaries(char_bounds, chars.len(), pool);
                (Some(length), Some(char_bounds))
            }
            _ => (None, None),
        };

        if chars.is_empty() {
            if max_len > 0 {
                chars.push(random_char(pool, rng));
                if let Some(cb) = chars_b {
                    sync_char_boundaries(cb, chars.len(), pool);
                }
            }
            *value = chars.into_iter().collect();
            return;
        }

        match (length_b, chars_b) {
            (Some(length_b), Some(chars_b)) => {
                let within_normal = rng.gen_bool(WITHIN_NORMAL);
                let normal_char = rng.gen_bool(PROB_MUTATE_CHAR);
                let all_chars_reached = chars_b.iter().all(|b| b.reached);

                let mut do_char = if all_chars_reached { !within_normal } else { normal_char };
                let mut do_len = if length_b.reached { !within_normal } else { !normal_char };
                if do_char == do_len {
                    if rng.gen_bool(0.5) {
                        do_char = !do_char;
                    } else {
                        do_len = !do_len;
                    }
                }

                if do_char {
                    // prefer the first index whose boundary is still open
                    let index = if rng.gen_bool(WITHIN_NORMAL) {
                        chars_b
                            .iter()
                            .position(|b| !b.reached)
                            .unwrap_or_else(|| rng.gen_range(0..chars.len()))
                    } else {
                        rng.gen_range(0..chars.len())
                    };
                    let current = chars[index] as u32 as i64;
                    let b = &chars_b[index];
                    let code = if !b.reached {
                        b.sample_int(current, rng)
                    } else {
                        None
                    }
                    .unwrap_or_else(|| {
                        standard_int(current, char_min(pool) as i64, char_max(pool) as i64, rng)
                    });
                    chars[index] = char::from_u32(code as u32).unwrap_or('_');
                } else if do_len {
                    mutate_length(&mut chars, min_len, max_len, pool, rng);
                    sync_char_boundaries(chars_b, chars.len(), pool);
                }
            }
            _ => {
                if rng.gen_bool(PROB_MUTATE_CHAR) {
                    let index = rng.gen_range(0..chars.len());
                    let current = chars[index];
                    let mut replacement = random_char(pool, rng);
                    while replacement == current {
                        replacement = random_char(pool, rng);
                    }
                    chars[index] = replacement;
                } else {
                    mutate_length(&mut chars, min_len, max_len, pool, rng);
                }
            }
        }

        *value = chars.into_iter().collect();
    }

    /// Add, remove or swap an action, keeping every resource dependency
    /// satisfied; an infeasible change is reverted and reported as a no-op.
    fn mutate_structure(
        &self,
        individual: &mut Individual,
        impacts: &mut ImpactsOfIndividual,
        sampler: &dyn Sampler,
        rng: &mut ChaCha8Rng,
    ) -> MutationSpec {
        let mut spec = MutationSpec::default();

        let op = if individual.actions.len() < 2 {
            0
        } else {
            rng.gen_range(0..3)
        };

        match op {
            0 => {
                let action = sampler.random_action(rng);
                let position = rng.gen_range(0..=individual.actions.len());
                individual.actions.insert(position, action.clone());
                if individual.verify_dependencies() {
                    impacts.insert_action(position, &action);
                    spec.structure = true;
                } else {
                    individual.actions.remove(position);
                    individual.actions.push(action.clone());
                    if individual.verify_dependencies() {
                        impacts.insert_action(individual.actions.len() - 1, &action);
                        spec.structure = true;
                    } else {
                        individual.actions.pop();
                        debug!("No feasible position for action {}; structural mutation skipped", action.name);
                    }
                }
            }
            1 => {
                let removable = individual.removable_actions();
                if individual.actions.len() > 1 && !removable.is_empty() {
                    let index = removable[rng.gen_range(0..removable.len())];
                    individual.actions.remove(index);
                    impacts.remove_action(index);
                    spec.structure = true;
                }
            }
            _ => {
                let a = rng.gen_range(0..individual.actions.len());
                let b = rng.gen_range(0..individual.actions.len());
                if a != b {
                    individual.actions.swap(a, b);
                    if individual.verify_dependencies() {
                        impacts.swap_actions(a, b);
                        spec.structure = true;
                    } else {
                        individual.actions.swap(a, b);
                    }
                }
            }
        }

        spec
    }

    /// Once the fitness delta of the mutation is known, narrow the value
    /// boundaries of every mutated gene accordingly.
    pub fn evaluate_mutation(
        &self,
        spec: &MutationSpec,
        individual: &Individual,
        impacts: &mut ImpactsOfIndividual,
        improved: bool,
    ) {
        if !self.param.mutation.archive_mutation {
            return;
        }
        for m in &spec.genes {
            if m.kind != MutationKind::Value {
                continue;
            }
            let current = individual
                .actions
                .get(m.action_index)
                .and_then(|a| a.genes.get(m.gene_index))
                .and_then(|g| g.descend(&m.path));
            let previous = m.previous.descend(&m.path);
            let node = impacts
                .gene_impact_mut(m.action_index, m.gene_index)
                .and_then(|n| n.descend_mut(&m.path));
            let (current, previous, node) = match (current, previous, node) {
                (Some(c), Some(p), Some(n)) => (c, p, n),
                _ => {
                    warn!("Mutated gene no longer addressable; boundary update skipped");
                    continue;
                }
            };
            update_boundary(node, previous, current, improved);
        }
    }
}

/// Record the outcome of every mutation in `spec` on the matching impact
/// records: value mutations on the gene's counters, size mutations on the
/// array's size counters, structural mutations on the individual's structure
/// record.
pub fn record_mutation_outcomes(
    impacts: &mut ImpactsOfIndividual,
    spec: &MutationSpec,
    touched: &BTreeSet<TargetId>,
    impacted: &BTreeSet<TargetId>,
    improved: &BTreeSet<TargetId>,
) {
    if spec.structure {
        impacts.structure.record_outcome(touched, impacted, improved);
    }
    'genes: for m in &spec.genes {
        let mut node = match impacts.gene_impact_mut(m.action_index, m.gene_index) {
            Some(n) => n,
            None => continue,
        };
        // a composite is manipulated whenever one of its children is: record
        // on every node along the path down to the changed one
        for &step in &m.path {
            node.counters.record_outcome(touched, impacted, improved);
            node = match node.children.get_mut(step) {
                Some(child) => child,
                None => continue 'genes,
            };
        }
        match m.kind {
            MutationKind::Size => {
                if let Some(size) = &mut node.size_counters {
                    size.record_outcome(touched, impacted, improved);
                }
            }
            MutationKind::Value => node.counters.record_outcome(touched, impacted, improved),
        }
    }
}

fn update_boundary(node: &mut GeneImpact, previous: &Gene, current: &Gene, improved: bool) {
    match (&mut node.boundary, previous, current) {
        (Some(GeneBoundary::Numeric(b)), Gene::Boolean { value: p }, Gene::Boolean { value: c }) => {
            b.update(*p as u8 as f64, *c as u8 as f64, improved);
        }
        (
            Some(GeneBoundary::Numeric(b)),
            Gene::Integer { value: p, .. },
            Gene::Integer { value: c, .. },
        ) => {
            b.update(*p as f64, *c as f64, improved);
        }
        (
            Some(GeneBoundary::Numeric(b)),
            Gene::Double { value: p, .. },
            Gene::Double { value: c, .. },
        ) => {
            b.update(*p, *c, improved);
        }
        (
            Some(GeneBoundary::Text { length, chars }),
            Gene::Text { value: p, .. },
            Gene::Text { value: c, .. },
        ) => {
            let prev: Vec<char> = p.chars().collect();
            let curr: Vec<char> = c.chars().collect();
            if prev.len() != curr.len() {
                length.update(prev.len() as f64, curr.len() as f64, improved);
            } else if let Some(i) = (0..curr.len()).find(|&i| prev[i] != curr[i]) {
                if let Some(b) = chars.get_mut(i) {
                    b.update(prev[i] as u32 as f64, curr[i] as u32 as f64, improved);
                }
            }
        }
        _ => {}
    }
}

fn sync_char_boundaries(chars: &mut Vec<MutationBoundary>, len: usize, pool: &CharPool) {
    chars.truncate(len);
    while chars.len() < len {
        chars.push(MutationBoundary::new(
            char_min(pool) as f64,
            char_max(pool) as f64,
            1.0,
        ));
    }
}

fn mutate_length(
    chars: &mut Vec<char>,
    min_len: usize,
    max_len: usize,
    pool: &CharPool,
    rng: &mut ChaCha8Rng,
) {
    let grow_ok = chars.len() < max_len;
    let shrink_ok = chars.len() > min_len && !chars.is_empty();
    if shrink_ok && (!grow_ok || rng.gen_bool(0.5)) {
        chars.pop();
    } else if grow_ok {
        chars.push(random_char(pool, rng));
    }
}

/// Uniform draw over the legal range, biased 50% toward the middle half,
/// always different from `current` when the range allows it
fn standard_int(current: i64, min: i64, max: i64, rng: &mut ChaCha8Rng) -> i64 {
    if min >= max {
        return current;
    }
    loop {
        let quarter = (max - min) / 4;
        let v = if rng.gen_bool(0.5) {
            rng.gen_range((min + quarter)..=(max - quarter))
        } else {
            rng.gen_range(min..=max)
        };
        if v != current {
            return v;
        }
    }
}

fn standard_double(current: f64, min: f64, max: f64, rng: &mut ChaCha8Rng) -> f64 {
    if min >= max {
        return current;
    }
    loop {
        let quarter = (max - min) / 4.0;
        let v = if rng.gen_bool(0.5) {
            rng.gen_range((min + quarter)..=(max - quarter))
        } else {
            rng.gen_range(min..=max)
        };
        if v != current {
            return v;
        }
    }
}
