use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::core::{EntityKey, GeoPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Device,
    Location,
}

/// Least-recently-seen first.
#[derive(Debug, Default)]
struct BoundedSet {
    members: VecDeque<(String, DateTime<Utc>)>,
}

impl BoundedSet {
    fn evict_expired(&mut self, ttl: Duration, now: DateTime<Utc>) {
        self.members.retain(|(_, seen)| now - *seen <= ttl);
    }
}

/// Per-entity sets of recently seen values with a capacity and a rolling TTL.
/// Seeing a member again refreshes its TTL.
pub struct MemberSets {
    sets: DashMap<(EntityKey, MemberKind), BoundedSet>,
    capacity: usize,
    ttl: Duration,
}

impl MemberSets {
    pub fn new(capacity: usize, ttl_seconds: u64) -> Self {
        Self {
            sets: DashMap::new(),
            capacity: capacity.max(1),
            ttl: Duration::seconds(ttl_seconds as i64),
        }
    }

    pub fn remember(&self, entity: &EntityKey, kind: MemberKind, member: &str, now: DateTime<Utc>) {
        let mut set = self.sets.entry((entity.clone(), kind)).or_default();
        set.evict_expired(self.ttl, now);
        if let Some(pos) = set.members.iter().position(|(m, _)| m == member) {
            set.members.remove(pos);
        }
        set.members.push_back((member.to_string(), now));
        while set.members.len() > self.capacity {
            set.members.pop_front();
        }
    }

    pub fn contains(&self, entity: &EntityKey, kind: MemberKind, member: &str, now: DateTime<Utc>) -> bool {
        self.sets.get(&(entity.clone(), kind)).is_some_and(|set| {
            set.members
                .iter()
                .any(|(m, seen)| m == member && now - *seen <= self.ttl)
        })
    }

    pub fn members(&self, entity: &EntityKey, kind: MemberKind, now: DateTime<Utc>) -> Vec<String> {
        match self.sets.get(&(entity.clone(), kind)) {
            Some(set) => set
                .members
                .iter()
                .filter(|(_, seen)| now - *seen <= self.ttl)
                .map(|(m, _)| m.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

pub(crate) fn encode_point(point: GeoPoint) -> String {
    format!("{:.5},{:.5}", point.lat, point.lng)
}

pub(crate) fn decode_point(s: &str) -> Option<GeoPoint> {
    let (lat, lng) = s.split_once(',')?;
    Some(GeoPoint::new(lat.parse().ok()?, lng.parse().ok()?))
}
