//! # Membership Registry
//!
//! Tracks every chat server that ever asked for a rank.
//!
//! Ranks come from a monotonic counter starting at 0 and are never reused.
//! Liveness is evaluated lazily: an expired member stays in the map and is
//! only filtered out at read time. If it talks to the reference service again
//! it becomes live again with its original rank.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::messages::MemberInfo;

/// Default liveness window.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// One known server replica.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub name: String,
    pub rank: u64,
    pub last_seen: Instant,
}

/// Result of [`MembershipRegistry::register_or_get_rank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub rank: u64,
    /// True the first time this name registers
    pub is_new: bool,
}

#[derive(Debug)]
pub struct MembershipRegistry {
    members: HashMap<String, MemberRecord>,
    next_rank: u64,
    liveness_window: Duration,
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new(LIVENESS_WINDOW)
    }
}

impl MembershipRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            members: HashMap::new(),
            next_rank: 0,
            liveness_window,
        }
    }

    /// Return the rank of `name`, assigning the next one on first sight.
    /// Refreshes `last_seen` either way.
    pub fn register_or_get_rank(&mut self, name: &str, now: Instant) -> Registration {
        if let Some(record) = self.members.get_mut(name) {
            record.last_seen = now;
            return Registration {
                rank: record.rank,
                is_new: false,
            };
        }

        let rank = self.next_rank;
        self.next_rank += 1;
        self.members.insert(
            name.to_string(),
            MemberRecord {
                name: name.to_string(),
                rank,
                last_seen: now,
            },
        );
        Registration { rank, is_new: true }
    }

    /// Refresh `last_seen` for a known member. Unknown names are ignored.
    /// Returns whether the member was known.
    pub fn refresh_heartbeat(&mut self, name: &str, now: Instant) -> bool {
        match self.members.get_mut(name) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Members seen within the liveness window, ordered by rank.
    pub fn list_active(&self, now: Instant) -> Vec<MemberInfo> {
        let mut active: Vec<MemberInfo> = self
            .members
            .values()
            .filter(|record| self.is_live(record, now))
            .map(|record| MemberInfo {
                name: record.name.clone(),
                rank: record.rank,
            })
            .collect();
        active.sort_by_key(|member| member.rank);
        active
    }

    pub fn is_live(&self, record: &MemberRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.last_seen) < self.liveness_window
    }

    pub fn get(&self, name: &str) -> Option<&MemberRecord> {
        self.members.get(name)
    }

    /// Number of members ever registered, live or not.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(members: &[MemberInfo]) -> Vec<&str> {
        members.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn same_name_keeps_its_rank() {
        let mut registry = MembershipRegistry::default();
        let now = Instant::now();

        let first = registry.register_or_get_rank("server_a", now);
        let second = registry.register_or_get_rank("server_a", now);

        assert_eq!(first, Registration { rank: 0, is_new: true });
        assert_eq!(second, Registration { rank: 0, is_new: false });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_names_get_increasing_ranks() {
        let mut registry = MembershipRegistry::default();
        let now = Instant::now();

        let ranks: Vec<u64> = (0..5)
            .map(|i| registry.register_or_get_rank(&format!("server_{}", i), now).rank)
            .collect();

        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn liveness_window_boundary() {
        let mut registry = MembershipRegistry::default();
        let t0 = Instant::now();
        registry.register_or_get_rank("server_a", t0);

        let at_29 = registry.list_active(t0 + Duration::from_secs(29));
        let at_31 = registry.list_active(t0 + Duration::from_secs(31));

        assert_eq!(names(&at_29), vec!["server_a"]);
        assert!(at_31.is_empty());
        // lazily filtered, not purged
        assert!(registry.get("server_a").is_some());
    }

    #[test]
    fn reregistering_after_expiry_keeps_original_rank() {
        let mut registry = MembershipRegistry::default();
        let t0 = Instant::now();
        registry.register_or_get_rank("server_a", t0);
        registry.register_or_get_rank("server_b", t0);

        let later = t0 + Duration::from_secs(60);
        assert!(registry.list_active(later).is_empty());

        let again = registry.register_or_get_rank("server_a", later);
        assert_eq!(again, Registration { rank: 0, is_new: false });
        assert_eq!(
            registry.list_active(later),
            vec![MemberInfo {
                name: "server_a".into(),
                rank: 0
            }]
        );
    }

    #[test]
    fn heartbeat_refreshes_known_members_only() {
        let mut registry = MembershipRegistry::default();
        let t0 = Instant::now();
        registry.register_or_get_rank("server_a", t0);

        let t20 = t0 + Duration::from_secs(20);
        assert!(registry.refresh_heartbeat("server_a", t20));
        assert!(!registry.refresh_heartbeat("ghost", t20));
        assert_eq!(registry.len(), 1);

        let t45 = t0 + Duration::from_secs(45);
        assert_eq!(names(&registry.list_active(t45)), vec!["server_a"]);
    }

    #[test]
    fn listing_is_ordered_by_rank() {
        let mut registry = MembershipRegistry::default();
        let now = Instant::now();
        for name in ["zulu", "alpha", "mike"] {
            registry.register_or_get_rank(name, now);
        }
        assert_eq!(names(&registry.list_active(now)), vec!["zulu", "alpha", "mike"]);
    }
}
