use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one independent testing objective (a branch, a status code,
/// a fault signature). Sparse and unbounded; most individuals touch only a
/// handful.
pub type TargetId = u32;

/// Heuristic value meaning "fully covered"
pub const MAX_VALUE: f64 = 1.0;

/// Heuristic score of one individual for one target, together with the index
/// of the action whose execution reached the target.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct TargetHeuristic {
    /// Value in [0,1], higher is better, 1.0 means covered
    pub score: f64,
    /// Index of the action that reached the target
    pub action_index: usize,
}

/// Non-coverage heuristic (e.g. aggregated SQL distance). Lower is better.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct ExtraHeuristic {
    pub description: String,
    pub value: f64,
}

/// Fault observed while executing one action of an individual
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct Fault {
    pub action_index: usize,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitnessError {
    OutOfRange { target: TargetId, score: f64 },
}

impl fmt::Display for FitnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitnessError::OutOfRange { target, score } => {
                write!(f, "heuristic {} for target {} outside [0,1]", score, target)
            }
        }
    }
}

impl std::error::Error for FitnessError {}

/// Result of evaluating one individual: a per-target heuristic vector plus
/// secondary heuristics and fault markers. Immutable once handed to the
/// archive.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct FitnessValue {
    targets: BTreeMap<TargetId, TargetHeuristic>,
    pub extra: Vec<ExtraHeuristic>,
    pub faults: Vec<Fault>,
}

impl FitnessValue {
    pub fn new() -> FitnessValue {
        FitnessValue {
            targets: BTreeMap::new(),
            extra: Vec::new(),
            faults: Vec::new(),
        }
    }

    /// Record the heuristic for a target. Rejects values outside [0,1];
    /// a zero is dropped since an untouched target carries no information.
    pub fn set_heuristic(
        &mut self,
        target: TargetId,
        score: f64,
        action_index: usize,
    ) -> Result<(), FitnessError> {
        if !(0.0..=MAX_VALUE).contains(&score) || !score.is_finite() {
            return Err(FitnessError::OutOfRange { target, score });
        }
        if score == 0.0 {
            return Ok(());
        }
        let entry = self
            .targets
            .entry(target)
            .or_insert(TargetHeuristic { score, action_index });
        if score >= entry.score {
            entry.score = score;
            entry.action_index = action_index;
        }
        Ok(())
    }

    pub fn heuristic(&self, target: TargetId) -> f64 {
        self.targets.get(&target).map(|h| h.score).unwrap_or(0.0)
    }

    pub fn does_cover(&self, target: TargetId) -> bool {
        self.heuristic(target) >= MAX_VALUE
    }

    pub fn view(&self) -> &BTreeMap<TargetId, TargetHeuristic> {
        &self.targets
    }

    /// Targets with a non-zero heuristic
    pub fn reached_targets(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.targets.keys().copied()
    }

    pub fn covered_targets(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.targets
            .iter()
            .filter(|(_, h)| h.score >= MAX_VALUE)
            .map(|(t, _)| *t)
    }

    /// Sum of all per-target heuristics, used as a collateral-coverage score
    /// when breaking ties between covering individuals of equal length.
    pub fn score(&self) -> f64 {
        self.targets.values().map(|h| h.score).sum()
    }

    /// Element-wise comparison of the extra heuristics; lower distances win.
    /// A missing element loses against a present one.
    pub fn compare_extra(&self, other: &FitnessValue) -> Ordering {
        let n = self.extra.len().max(other.extra.len());
        for i in 0..n {
            let cmp = match (self.extra.get(i), other.extra.get(i)) {
                (Some(a), Some(b)) => b.value.partial_cmp(&a.value).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }

    /// Deterministic total order for one target: heuristic value first, then
    /// extra heuristics element-wise, then fewer actions. Strict: an
    /// identical individual is never "better".
    pub fn better_than(
        &self,
        target: TargetId,
        other: &FitnessValue,
        self_size: usize,
        other_size: usize,
    ) -> bool {
        let a = self.heuristic(target);
        let b = other.heuristic(target);
        if a != b {
            return a > b;
        }
        match self.compare_extra(other) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self_size < other_size,
        }
    }

    /// Element-wise maximum merge, used to build `Solution::overall`
    pub fn merge_max(&mut self, other: &FitnessValue) {
        for (target, h) in &other.targets {
            let entry = self
                .targets
                .entry(*target)
                .or_insert_with(|| h.clone());
            if h.score > entry.score {
                *entry = h.clone();
            }
        }
        for (i, e) in other.extra.iter().enumerate() {
            match self.extra.get_mut(i) {
                Some(mine) => {
                    if e.value < mine.value {
                        mine.value = e.value;
                    }
                }
                None => self.extra.push(e.clone()),
            }
        }
    }

    /// Defensive check on externally produced values (e.g. deserialized
    /// solutions): every stored heuristic must be finite, positive and <= 1.
    pub fn validate(&self) -> Result<(), FitnessError> {
        for (target, h) in &self.targets {
            if !h.score.is_finite() || h.score <= 0.0 || h.score > MAX_VALUE {
                return Err(FitnessError::OutOfRange {
                    target: *target,
                    score: h.score,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(pairs: &[(TargetId, f64)]) -> FitnessValue {
        let mut f = FitnessValue::new();
        for (t, s) in pairs {
            f.set_heuristic(*t, *s, 0).unwrap();
        }
        f
    }

    #[test]
    fn test_set_heuristic_rejects_out_of_range() {
        let mut f = FitnessValue::new();
        assert!(f.set_heuristic(0, 1.5, 0).is_err());
        assert!(f.set_heuristic(0, -0.1, 0).is_err());
        assert!(f.set_heuristic(0, f64::NAN, 0).is_err());
        assert!(f.set_heuristic(0, 1.0, 0).is_ok());
    }

    #[test]
    fn test_zero_scores_are_dropped() {
        let mut f = FitnessValue::new();
        f.set_heuristic(3, 0.0, 0).unwrap();
        assert_eq!(f.view().len(), 0);
        assert_eq!(f.heuristic(3), 0.0);
    }

    #[test]
    fn test_set_heuristic_keeps_best() {
        let mut f = FitnessValue::new();
        f.set_heuristic(1, 0.5, 0).unwrap();
        f.set_heuristic(1, 0.3, 1).unwrap();
        assert_eq!(f.heuristic(1), 0.5);
        f.set_heuristic(1, 0.8, 2).unwrap();
        assert_eq!(f.heuristic(1), 0.8);
        assert_eq!(f.view()[&1].action_index, 2);
    }

    #[test]
    fn test_does_cover() {
        let f = fv(&[(0, 1.0), (1, 0.99)]);
        assert!(f.does_cover(0));
        assert!(!f.does_cover(1));
        assert!(!f.does_cover(7));
        assert_eq!(f.covered_targets().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_better_than_is_strict_lexicographic() {
        let a = fv(&[(0, 0.7)]);
        let b = fv(&[(0, 0.5)]);
        assert!(a.better_than(0, &b, 5, 2));
        assert!(!b.better_than(0, &a, 1, 5));

        // equal heuristic, shorter wins
        let c = fv(&[(0, 0.5)]);
        assert!(b.better_than(0, &c, 2, 3));
        assert!(!b.better_than(0, &c, 3, 3));

        // equal everything: not better
        assert!(!b.better_than(0, &c, 3, 3));
    }

    #[test]
    fn test_extra_heuristics_break_ties_before_size() {
        let mut a = fv(&[(0, 0.5)]);
        a.extra.push(ExtraHeuristic { description: "sql".into(), value: 1.0 });
        let mut b = fv(&[(0, 0.5)]);
        b.extra.push(ExtraHeuristic { description: "sql".into(), value: 4.0 });
        // a has lower distance: better even if longer
        assert!(a.better_than(0, &b, 9, 2));
        assert!(!b.better_than(0, &a, 2, 9));
    }

    #[test]
    fn test_merge_max() {
        let mut overall = fv(&[(0, 1.0), (1, 0.2)]);
        let other = fv(&[(1, 0.5), (2, 1.0)]);
        overall.merge_max(&other);
        assert_eq!(overall.heuristic(0), 1.0);
        assert_eq!(overall.heuristic(1), 0.5);
        assert_eq!(overall.heuristic(2), 1.0);
    }

    #[test]
    fn test_score_sums_heuristics() {
        let f = fv(&[(0, 1.0), (1, 0.5)]);
        assert!((f.score() - 1.5).abs() < 1e-9);
    }
}
