use crate::fitness::TargetId;
use crate::gene::Gene;
use crate::individual::{Action, Individual};
use crate::mutator::GeneBoundary;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Online statistics on how often manipulating one element changed coverage.
///
/// `times_to_manipulate`, `times_of_no_impact` and `times_of_impact` are
/// accumulated over the whole lineage; `no_impact_from_impact` and
/// `no_improvement` are consecutive counters reset on every impact or
/// improvement for their target.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct ImpactCounters {
    pub times_to_manipulate: u32,
    pub times_of_no_impact: u32,
    pub times_of_impact: BTreeMap<TargetId, u32>,
    pub times_of_no_impact_with_targets: BTreeMap<TargetId, u32>,
    pub no_impact_from_impact: BTreeMap<TargetId, u32>,
    pub no_improvement: BTreeMap<TargetId, u32>,
}

impl ImpactCounters {
    /// Record the outcome of one mutation of this element.
    ///
    /// `touched` are the targets the evaluated individual reaches, `impacted`
    /// those whose heuristic changed against the pre-mutation fitness, and
    /// `improved` those the archive accepted the individual for. Each touched
    /// target lands in exactly one of the impact / no-impact maps.
    pub fn record_outcome(
        &mut self,
        touched: &BTreeSet<TargetId>,
        impacted: &BTreeSet<TargetId>,
        improved: &BTreeSet<TargetId>,
    ) {
        self.times_to_manipulate += 1;
        if !touched.iter().any(|t| impacted.contains(t)) {
            self.times_of_no_impact += 1;
        }
        for &t in touched {
            if impacted.contains(&t) {
                *self.times_of_impact.entry(t).or_insert(0) += 1;
                self.no_impact_from_impact.insert(t, 0);
                if improved.contains(&t) {
                    self.no_improvement.insert(t, 0);
                } else {
                    *self.no_improvement.entry(t).or_insert(0) += 1;
                }
            } else {
                *self
                    .times_of_no_impact_with_targets
                    .entry(t)
                    .or_insert(0) += 1;
                if self.times_of_impact.contains_key(&t) {
                    *self.no_impact_from_impact.entry(t).or_insert(0) += 1;
                }
                *self.no_improvement.entry(t).or_insert(0) += 1;
            }
        }
    }

    /// Highest impact ratio over the given targets, -1 when never manipulated
    pub fn impact_ratio(&self, targets: &BTreeSet<TargetId>) -> f64 {
        if self.times_to_manipulate == 0 {
            return -1.0;
        }
        targets
            .iter()
            .map(|t| {
                self.times_of_impact.get(t).copied().unwrap_or(0) as f64
                    / self.times_to_manipulate as f64
            })
            .fold(0.0, f64::max)
    }

    /// An exhausted dimension: every relevant target has gone `threshold`
    /// consecutive mutations without improvement.
    pub fn exhausted(&self, targets: &BTreeSet<TargetId>, threshold: u32) -> bool {
        if self.times_to_manipulate == 0 || targets.is_empty() {
            return false;
        }
        targets.iter().all(|t| {
            self.no_improvement.get(t).copied().unwrap_or(0) >= threshold
        })
    }
}

/// Statistical shadow of one gene: counters for the gene itself, a mirror of
/// its children, separate counters for array size mutations, and the value
/// boundary used by archive-based mutation.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct GeneImpact {
    pub counters: ImpactCounters,
    /// Array genes track size changes apart from element-value changes
    pub size_counters: Option<ImpactCounters>,
    pub children: Vec<GeneImpact>,
    pub boundary: Option<GeneBoundary>,
}

impl GeneImpact {
    pub fn from_gene(gene: &Gene) -> GeneImpact {
        let children = (0..gene.child_count())
            .map(|i| GeneImpact::from_gene(gene.child(i).unwrap()))
            .collect();
        GeneImpact {
            counters: ImpactCounters::default(),
            size_counters: match gene {
                Gene::Array { .. } => Some(ImpactCounters::default()),
                _ => None,
            },
            children,
            boundary: GeneBoundary::for_gene(gene),
        }
    }

    pub fn descend_mut(&mut self, path: &[usize]) -> Option<&mut GeneImpact> {
        let mut node = self;
        for &i in path {
            node = node.children.get_mut(i)?;
        }
        Some(node)
    }

    pub fn descend(&self, path: &[usize]) -> Option<&GeneImpact> {
        let mut node = self;
        for &i in path {
            node = node.children.get(i)?;
        }
        Some(node)
    }

    /// Realign children with a gene whose element list changed size.
    /// Surviving prefix keeps its statistics; new elements start fresh.
    pub fn sync_children(&mut self, gene: &Gene) {
        let wanted = gene.child_count();
        self.children.truncate(wanted);
        for i in self.children.len()..wanted {
            self.children.push(GeneImpact::from_gene(gene.child(i).unwrap()));
        }
    }
}

/// Shadow of a whole individual: one impact tree per top-level gene of each
/// action, plus a separate record for structural mutation of the action
/// sequence itself. Copied, never shared, when a lineage forks.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct ImpactsOfIndividual {
    pub actions: Vec<Vec<GeneImpact>>,
    pub structure: ImpactCounters,
}

impl ImpactsOfIndividual {
    pub fn from_individual(individual: &Individual) -> ImpactsOfIndividual {
        ImpactsOfIndividual {
            actions: individual
                .actions
                .iter()
                .map(|a| a.genes.iter().map(GeneImpact::from_gene).collect())
                .collect(),
            structure: ImpactCounters::default(),
        }
    }

    pub fn gene_impact_mut(
        &mut self,
        action_index: usize,
        gene_index: usize,
    ) -> Option<&mut GeneImpact> {
        self.actions.get_mut(action_index)?.get_mut(gene_index)
    }

    pub fn insert_action(&mut self, index: usize, action: &Action) {
        self.actions.insert(
            index.min(self.actions.len()),
            action.genes.iter().map(GeneImpact::from_gene).collect(),
        );
    }

    pub fn remove_action(&mut self, index: usize) {
        if index < self.actions.len() {
            self.actions.remove(index);
        }
    }

    pub fn swap_actions(&mut self, a: usize, b: usize) {
        if a < self.actions.len() && b < self.actions.len() {
            self.actions.swap(a, b);
        }
    }

    /// Flat view of every impact record with a stable descriptive id,
    /// used for the CSV impact export.
    pub fn flat_view(&self) -> Vec<(String, &ImpactCounters)> {
        let mut rows = vec![("structure".to_string(), &self.structure)];
        for (ai, genes) in self.actions.iter().enumerate() {
            for (gi, impact) in genes.iter().enumerate() {
                flatten_gene(&format!("action{}.gene{}", ai, gi), impact, &mut rows);
            }
        }
        rows
    }
}

fn flatten_gene<'a>(
    id: &str,
    impact: &'a GeneImpact,
    rows: &mut Vec<(String, &'a ImpactCounters)>,
) {
    rows.push((id.to_string(), &impact.counters));
    if let Some(size) = &impact.size_counters {
        rows.push((format!("{}.size", id), size));
    }
    for (ci, child) in impact.children.iter().enumerate() {
        flatten_gene(&format!("{}.{}", id, ci), child, rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(ids: &[TargetId]) -> BTreeSet<TargetId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_record_outcome_accounting() {
        let mut c = ImpactCounters::default();
        // 3 mutations touching target 0: impact, impact+improve, no impact
        c.record_outcome(&targets(&[0]), &targets(&[0]), &targets(&[]));
        c.record_outcome(&targets(&[0]), &targets(&[0]), &targets(&[0]));
        c.record_outcome(&targets(&[0]), &targets(&[]), &targets(&[]));

        assert_eq!(c.times_to_manipulate, 3);
        assert_eq!(c.times_of_impact[&0], 2);
        assert_eq!(c.times_of_no_impact_with_targets[&0], 1);
        // every manipulation touching t is counted exactly once
        assert_eq!(
            c.times_of_impact[&0] + c.times_of_no_impact_with_targets[&0],
            c.times_to_manipulate
        );
    }

    #[test]
    fn test_consecutive_counters_reset() {
        let mut c = ImpactCounters::default();
        let t = targets(&[1]);
        c.record_outcome(&t, &targets(&[1]), &targets(&[]));
        c.record_outcome(&t, &targets(&[1]), &targets(&[]));
        assert_eq!(c.no_improvement[&1], 2);

        c.record_outcome(&t, &targets(&[1]), &targets(&[1]));
        assert_eq!(c.no_improvement[&1], 0);

        // impact history exists, so a no-impact bumps no_impact_from_impact
        c.record_outcome(&t, &targets(&[]), &targets(&[]));
        assert_eq!(c.no_impact_from_impact[&1], 1);
        c.record_outcome(&t, &targets(&[1]), &targets(&[]));
        assert_eq!(c.no_impact_from_impact[&1], 0);
    }

    #[test]
    fn test_impact_ratio_and_exhaustion() {
        let mut c = ImpactCounters::default();
        assert_eq!(c.impact_ratio(&targets(&[0])), -1.0);

        let t = targets(&[0]);
        c.record_outcome(&t, &targets(&[0]), &targets(&[]));
        c.record_outcome(&t, &targets(&[]), &targets(&[]));
        assert!((c.impact_ratio(&t) - 0.5).abs() < 1e-9);

        assert!(!c.exhausted(&t, 3));
        c.record_outcome(&t, &targets(&[]), &targets(&[]));
        assert!(c.exhausted(&t, 3));
    }

    #[test]
    fn test_from_gene_mirrors_shape() {
        let gene = Gene::Object {
            fields: vec![
                ("a".to_string(), Gene::Boolean { value: false }),
                (
                    "b".to_string(),
                    Gene::Array {
                        elements: vec![Gene::Integer { value: 0, min: 0, max: 9 }],
                        template: Box::new(Gene::Integer { value: 0, min: 0, max: 9 }),
                        min_size: 0,
                        max_size: 4,
                    },
                ),
            ],
        };
        let impact = GeneImpact::from_gene(&gene);
        assert_eq!(impact.children.len(), 2);
        assert!(impact.children[1].size_counters.is_some());
        assert_eq!(impact.children[1].children.len(), 1);
        assert!(impact.descend(&[1, 0]).is_some());
        assert!(impact.descend(&[2]).is_none());
    }

    #[test]
    fn test_sync_children_keeps_prefix_statistics() {
        let mut gene = Gene::Array {
            elements: vec![
                Gene::Integer { value: 0, min: 0, max: 9 },
                Gene::Integer { value: 1, min: 0, max: 9 },
            ],
            template: Box::new(Gene::Integer { value: 0, min: 0, max: 9 }),
            min_size: 0,
            max_size: 4,
        };
        let mut impact = GeneImpact::from_gene(&gene);
        impact.children[0].counters.times_to_manipulate = 5;

        if let Gene::Array { elements, template, .. } = &mut gene {
            elements.push((**template).clone());
        }
        impact.sync_children(&gene);
        assert_eq!(impact.children.len(), 3);
        assert_eq!(impact.children[0].counters.times_to_manipulate, 5);
        assert_eq!(impact.children[2].counters.times_to_manipulate, 0);
    }

    #[test]
    fn test_flat_view_lists_structure_and_sizes() {
        let mut ind = Individual::new();
        ind.actions.push(Action {
            name: "a".to_string(),
            genes: vec![Gene::Array {
                elements: vec![],
                template: Box::new(Gene::Boolean { value: false }),
                min_size: 0,
                max_size: 2,
            }],
            creates: None,
            uses: None,
        });
        let impacts = ImpactsOfIndividual::from_individual(&ind);
        let rows = impacts.flat_view();
        let ids: Vec<&str> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"structure"));
        assert!(ids.contains(&"action0.gene0"));
        assert!(ids.contains(&"action0.gene0.size"));
    }
}
