//! Set difference between two snapshots of the same category.

use std::collections::BTreeSet;

/// Identity keys of one snapshot: board names and `(board, code)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotKeys {
    pub boards: BTreeSet<String>,
    pub items: BTreeSet<(String, String)>,
}

impl SnapshotKeys {
    pub fn new<B, I>(boards: B, items: I) -> Self
    where
        B: IntoIterator<Item = String>,
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            boards: boards.into_iter().collect(),
            items: items.into_iter().collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.boards.len() + self.items.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub has_prior: bool,
    pub added_boards: BTreeSet<String>,
    pub removed_boards: BTreeSet<String>,
    pub added_items: BTreeSet<(String, String)>,
    pub removed_items: BTreeSet<(String, String)>,
    pub change_rate: f64,
}

impl SnapshotDiff {
    /// Without a prior snapshot everything in `current` counts as added and
    /// the rate is zero. A prior snapshot with no boards and no items also
    /// yields a zero rate.
    pub fn between(current: &SnapshotKeys, prior: Option<&SnapshotKeys>) -> Self {
        let Some(prior) = prior else {
            return Self {
                has_prior: false,
                added_boards: current.boards.clone(),
                added_items: current.items.clone(),
                ..Default::default()
            };
        };

        let added_boards: BTreeSet<_> = current.boards.difference(&prior.boards).cloned().collect();
        let removed_boards: BTreeSet<_> = prior.boards.difference(&current.boards).cloned().collect();
        let added_items: BTreeSet<_> = current.items.difference(&prior.items).cloned().collect();
        let removed_items: BTreeSet<_> = prior.items.difference(&current.items).cloned().collect();

        let changed = added_boards.len() + removed_boards.len() + added_items.len() + removed_items.len();
        let denominator = prior.size();
        let change_rate = if denominator == 0 {
            0.0
        } else {
            changed as f64 / denominator as f64 * 100.0
        };

        Self {
            has_prior: true,
            added_boards,
            removed_boards,
            added_items,
            removed_items,
            change_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added_boards.is_empty()
            && self.removed_boards.is_empty()
            && self.added_items.is_empty()
            && self.removed_items.is_empty()
    }

    /// Whether itemized detail rows should be written.
    pub fn has_details(&self) -> bool {
        self.has_prior && !self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(boards: &[(&str, &[&str])]) -> SnapshotKeys {
        SnapshotKeys::new(
            boards.iter().map(|(b, _)| b.to_string()),
            boards
                .iter()
                .flat_map(|(b, codes)| codes.iter().map(move |c| (b.to_string(), c.to_string()))),
        )
    }

    fn pair(b: &str, c: &str) -> (String, String) {
        (b.to_string(), c.to_string())
    }

    #[test]
    fn diff_against_previous_concept_batch() {
        let prior = keys(&[("X", &["c1", "c2"]), ("Y", &["c3"])]);
        let current = keys(&[("X", &["c1", "c3"]), ("Z", &["c4"])]);

        let diff = SnapshotDiff::between(&current, Some(&prior));
        assert!(diff.has_prior);
        assert_eq!(diff.added_boards, BTreeSet::from(["Z".to_string()]));
        assert_eq!(diff.removed_boards, BTreeSet::from(["Y".to_string()]));
        assert_eq!(diff.added_items, BTreeSet::from([pair("X", "c3"), pair("Z", "c4")]));
        assert_eq!(diff.removed_items, BTreeSet::from([pair("X", "c2"), pair("Y", "c3")]));
        // 6 changes over 2 boards + 3 items
        assert!((diff.change_rate - 120.0).abs() < 1e-9);
        assert!(diff.has_details());
    }

    #[test]
    fn first_batch_counts_everything_as_added_with_zero_rate() {
        let current = keys(&[("X", &["c1"]), ("Y", &["c2", "c3"])]);
        let diff = SnapshotDiff::between(&current, None);
        assert!(!diff.has_prior);
        assert_eq!(diff.added_boards.len(), 2);
        assert_eq!(diff.added_items.len(), 3);
        assert!(diff.removed_boards.is_empty());
        assert_eq!(diff.change_rate, 0.0);
        assert!(!diff.has_details());
    }

    #[test]
    fn empty_prior_yields_zero_rate() {
        let current = keys(&[("X", &["c1"])]);
        let diff = SnapshotDiff::between(&current, Some(&SnapshotKeys::default()));
        assert!(diff.has_prior);
        assert_eq!(diff.added_boards.len(), 1);
        assert_eq!(diff.change_rate, 0.0);
    }

    #[test]
    fn identical_snapshots_have_no_details() {
        let snap = keys(&[("X", &["c1", "c2"])]);
        let diff = SnapshotDiff::between(&snap, Some(&snap));
        assert!(diff.is_empty());
        assert!(!diff.has_details());
        assert_eq!(diff.change_rate, 0.0);
    }

    #[test]
    fn added_and_removed_are_disjoint_and_repeatable() {
        let shapes: [&[(&str, &[&str])]; 4] = [
            &[("A", &["1", "2"]), ("B", &["3"])],
            &[("A", &["2", "4"]), ("C", &["3", "5"])],
            &[("B", &["3"]), ("C", &["5"]), ("D", &["1", "2", "3"])],
            &[],
        ];
        for cur in &shapes {
            for prev in &shapes {
                let current = keys(cur);
                let prior = keys(prev);
                let diff = SnapshotDiff::between(&current, Some(&prior));
                assert!(diff.added_boards.is_disjoint(&diff.removed_boards));
                assert!(diff.added_items.is_disjoint(&diff.removed_items));
                assert_eq!(diff.added_boards.len(), current.boards.difference(&prior.boards).count());
                assert_eq!(diff.removed_items.len(), prior.items.difference(&current.items).count());
                assert_eq!(diff, SnapshotDiff::between(&current, Some(&prior)));
            }
        }
    }
}
