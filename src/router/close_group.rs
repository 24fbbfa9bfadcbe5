//! Close group membership changes and their acceptance threshold.
//!
//! How nodes agree on a new close group is left to implementations of
//! [GroupChangeAgreement]. The only contract is that a change is not applied
//! before `quorum_size` independent observers reported it.

use std::collections::{BTreeSet, VecDeque};

use crate::common::Id;

/// Default number of peers in a close group.
pub const GROUP_SIZE: usize = 32;
/// Default number of corroborating observations required to accept a change.
pub const QUORUM_SIZE: usize = 29;
/// Default number of differences collecting observations at the same time.
pub const MAX_PROPOSALS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
/// A close group transition: ids entering and ids leaving the group.
pub struct CloseGroupDifference {
    pub entering: Vec<Id>,
    pub leaving: Vec<Id>,
}

impl CloseGroupDifference {
    /// Difference between two memberships. Both lists come out sorted.
    pub fn between(old: &[Id], new: &[Id]) -> Self {
        let old: BTreeSet<&Id> = old.iter().collect();
        let new: BTreeSet<&Id> = new.iter().collect();

        CloseGroupDifference {
            entering: new.difference(&old).map(|id| **id).collect(),
            leaving: old.difference(&new).map(|id| **id).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entering.is_empty() && self.leaving.is_empty()
    }

    fn normalized(&self) -> Self {
        let mut entering = self.entering.clone();
        let mut leaving = self.leaving.clone();
        entering.sort();
        entering.dedup();
        leaving.sort();
        leaving.dedup();

        CloseGroupDifference { entering, leaving }
    }
}

/// Decides when a reported close group change may be applied.
pub trait GroupChangeAgreement: std::fmt::Debug + Send {
    /// Record that `observer` reports `difference`.
    ///
    /// Returns the difference once it is accepted, and `None` until then.
    fn observe(
        &mut self,
        observer: Id,
        difference: &CloseGroupDifference,
    ) -> Option<CloseGroupDifference>;
}

#[derive(Debug)]
/// Accepts a difference once `quorum` distinct observers reported it.
///
/// At most `max_proposals` differences collect observations at once, the
/// oldest is forgotten to make room for a new one. Accepting a difference
/// forgets every other proposal, as they were made against the previous
/// membership.
pub struct QuorumAgreement {
    quorum: usize,
    max_proposals: usize,
    proposals: VecDeque<(CloseGroupDifference, BTreeSet<Id>)>,
}

impl QuorumAgreement {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            max_proposals: MAX_PROPOSALS,
            proposals: VecDeque::new(),
        }
    }

    /// Set how many differences may collect observations at once, at least 1.
    pub fn with_max_proposals(mut self, max_proposals: usize) -> Self {
        self.max_proposals = max_proposals.max(1);
        self
    }

    /// Distinct observers recorded so far for `difference`.
    pub fn observers(&self, difference: &CloseGroupDifference) -> usize {
        let difference = difference.normalized();

        self.proposals
            .iter()
            .find(|(proposal, _)| proposal == &difference)
            .map_or(0, |(_, observers)| observers.len())
    }

    /// Number of differences currently collecting observations.
    pub fn proposals(&self) -> usize {
        self.proposals.len()
    }
}

impl GroupChangeAgreement for QuorumAgreement {
    fn observe(
        &mut self,
        observer: Id,
        difference: &CloseGroupDifference,
    ) -> Option<CloseGroupDifference> {
        if difference.is_empty() {
            return None;
        }

        let difference = difference.normalized();

        let index = match self
            .proposals
            .iter()
            .position(|(proposal, _)| proposal == &difference)
        {
            Some(index) => index,
            None => {
                while self.proposals.len() >= self.max_proposals {
                    self.proposals.pop_front();
                }
                self.proposals
                    .push_back((difference.clone(), BTreeSet::new()));
                self.proposals.len() - 1
            }
        };

        let observers = &mut self.proposals[index].1;
        observers.insert(observer);

        if observers.len() >= self.quorum {
            self.proposals.clear();
            return Some(difference);
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn difference() {
        let a = Id::random();
        let b = Id::random();
        let c = Id::random();

        let difference = CloseGroupDifference::between(&[a, b], &[b, c]);

        assert_eq!(difference.entering, vec![c]);
        assert_eq!(difference.leaving, vec![a]);
        assert!(CloseGroupDifference::between(&[a, b], &[b, a]).is_empty());
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn quorum_is_smaller_than_group() {
        assert!(QUORUM_SIZE < GROUP_SIZE);
    }

    #[test]
    fn accepted_at_quorum() {
        let mut agreement = QuorumAgreement::new(3);
        let difference = CloseGroupDifference {
            entering: vec![Id::random()],
            leaving: vec![],
        };

        let observer = Id::random();
        assert_eq!(agreement.observe(observer, &difference), None);
        // The same observer twice does not count.
        assert_eq!(agreement.observe(observer, &difference), None);
        assert_eq!(agreement.observers(&difference), 1);

        assert_eq!(agreement.observe(Id::random(), &difference), None);
        assert_eq!(
            agreement.observe(Id::random(), &difference),
            Some(difference.clone())
        );

        // Accepted changes start over.
        assert_eq!(agreement.observers(&difference), 0);
    }

    #[test]
    fn order_of_ids_does_not_matter() {
        let mut agreement = QuorumAgreement::new(2);
        let a = Id::random();
        let b = Id::random();

        let first = CloseGroupDifference {
            entering: vec![a, b],
            leaving: vec![],
        };
        let second = CloseGroupDifference {
            entering: vec![b, a],
            leaving: vec![],
        };

        assert_eq!(agreement.observe(Id::random(), &first), None);
        assert!(agreement.observe(Id::random(), &second).is_some());
    }

    #[test]
    fn empty_difference_is_never_accepted() {
        let mut agreement = QuorumAgreement::new(1);

        assert_eq!(
            agreement.observe(Id::random(), &CloseGroupDifference::default()),
            None
        );
    }

    #[test]
    fn proposals_are_bounded() {
        let mut agreement = QuorumAgreement::new(QUORUM_SIZE);
        let observer = Id::random();

        let differences: Vec<CloseGroupDifference> = (0..10_000)
            .map(|_| CloseGroupDifference {
                entering: vec![Id::random()],
                leaving: vec![],
            })
            .collect();

        for difference in &differences {
            assert_eq!(agreement.observe(observer, difference), None);
        }

        assert_eq!(agreement.proposals(), MAX_PROPOSALS);
        // Oldest first out.
        assert_eq!(agreement.observers(&differences[0]), 0);
        assert_eq!(agreement.observers(&differences[9_999]), 1);
    }

    #[test]
    fn acceptance_forgets_other_proposals() {
        let mut agreement = QuorumAgreement::new(2).with_max_proposals(4);

        let stale = CloseGroupDifference {
            entering: vec![],
            leaving: vec![Id::random()],
        };
        let accepted = CloseGroupDifference {
            entering: vec![Id::random()],
            leaving: vec![],
        };

        agreement.observe(Id::random(), &stale);
        agreement.observe(Id::random(), &accepted);
        assert_eq!(agreement.proposals(), 2);

        assert!(agreement.observe(Id::random(), &accepted).is_some());
        assert_eq!(agreement.proposals(), 0);
        assert_eq!(agreement.observers(&stale), 0);
    }
}
