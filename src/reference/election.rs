//! # Coordinator Election
//!
//! Static-priority, bully-style election: among live members the lowest rank
//! wins. There are no election messages; the reference service re-derives
//! the coordinator periodically and after new registrations, and announces it
//! over the bus when it changes.
//!
//! Visibility of a change in liveness can lag by up to one re-evaluation
//! period.

use log::info;

use crate::common::clock::LogicalClock;
use crate::common::messages::{CoordinatorAnnouncement, MemberInfo};

/// Lowest-ranked member of `active`, if any.
pub fn compute_coordinator(active: &[MemberInfo]) -> Option<MemberInfo> {
    active.iter().min_by_key(|member| member.rank).cloned()
}

/// Remembers the last announced coordinator so announcements only go out on
/// change.
#[derive(Debug, Default)]
pub struct CoordinatorElector {
    last_announced: Option<MemberInfo>,
}

impl CoordinatorElector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_announced(&self) -> Option<&MemberInfo> {
        self.last_announced.as_ref()
    }

    /// Re-derive the coordinator from `active`.
    ///
    /// Returns an announcement, with a freshly ticked clock, when the
    /// coordinator differs from the last one announced, or whenever `force`
    /// is set and a coordinator exists. With no live member nothing is
    /// announced and the memory is cleared, so the next coordinator is always
    /// announced.
    pub fn maybe_announce(
        &mut self,
        active: &[MemberInfo],
        clock: &mut LogicalClock,
        force: bool,
    ) -> Option<CoordinatorAnnouncement> {
        let current = match compute_coordinator(active) {
            Some(member) => member,
            None => {
                if self.last_announced.take().is_some() {
                    info!("⚠️  No live servers, coordinator cleared");
                }
                return None;
            }
        };

        if !force && self.last_announced.as_ref() == Some(&current) {
            return None;
        }

        let clock = clock.tick();
        info!(
            "👑 Coordinator is {} (rank {}, clock {})",
            current.name, current.rank, clock
        );
        let announcement = CoordinatorAnnouncement {
            coordinator: current.name.clone(),
            rank: current.rank,
            clock,
        };
        self.last_announced = Some(current);
        Some(announcement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, rank: u64) -> MemberInfo {
        MemberInfo {
            name: name.to_string(),
            rank,
        }
    }

    #[test]
    fn lowest_rank_wins() {
        let active = vec![member("c", 3), member("a", 0), member("e", 5)];
        assert_eq!(compute_coordinator(&active), Some(member("a", 0)));

        let without_a = vec![member("c", 3), member("e", 5)];
        assert_eq!(compute_coordinator(&without_a), Some(member("c", 3)));
    }

    #[test]
    fn no_members_no_coordinator() {
        assert_eq!(compute_coordinator(&[]), None);
    }

    #[test]
    fn announces_only_on_change() {
        let mut elector = CoordinatorElector::new();
        let mut clock = LogicalClock::new();
        let active = vec![member("c", 3), member("a", 0), member("e", 5)];

        let first = elector.maybe_announce(&active, &mut clock, false).unwrap();
        assert_eq!(first.coordinator, "a");
        assert_eq!(first.rank, 0);
        assert_eq!(first.clock, 1);

        assert!(elector.maybe_announce(&active, &mut clock, false).is_none());
        assert_eq!(clock.time(), 1);

        let next = elector
            .maybe_announce(&[member("c", 3), member("e", 5)], &mut clock, false)
            .unwrap();
        assert_eq!(next.coordinator, "c");
        assert_eq!(next.clock, 2);
    }

    #[test]
    fn forced_announcement_repeats_current_coordinator() {
        let mut elector = CoordinatorElector::new();
        let mut clock = LogicalClock::new();
        let active = vec![member("a", 0)];

        elector.maybe_announce(&active, &mut clock, false).unwrap();
        let repeated = elector.maybe_announce(&active, &mut clock, true).unwrap();
        assert_eq!(repeated.coordinator, "a");
        assert_eq!(repeated.clock, 2);
    }

    #[test]
    fn empty_cluster_clears_memory() {
        let mut elector = CoordinatorElector::new();
        let mut clock = LogicalClock::new();
        let active = vec![member("a", 0)];

        elector.maybe_announce(&active, &mut clock, false).unwrap();
        assert!(elector.maybe_announce(&[], &mut clock, true).is_none());
        assert!(elector.last_announced().is_none());

        // the same member coming back is announced again
        assert!(elector.maybe_announce(&active, &mut clock, false).is_some());
    }
}
