//! Three-tier perception cache.
//!
//! - L1: per cell and faction, shortest TTL.
//! - L2: per cell and faction, longer TTL, only answers queries whose radius the
//!   cached radius covers to the configured ratio.
//! - L3: per hotspot cell and faction, longest TTL, only consulted inside hotspots.
//!
//! Entries expire by timestamp comparison at read time and by periodic purge.

use std::collections::HashMap;

use glam::IVec3;

use super::types::PerceptionResult;
use crate::actors::ActorView;
use crate::components::Faction;
use crate::config::PerceptionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

type CacheKey = (IVec3, Faction);

#[derive(Debug, Clone)]
struct CacheEntry {
    result: PerceptionResult,
    radius: f32,
    stored_at: f64,
}

impl CacheEntry {
    fn is_fresh(&self, now: f64, ttl: f32) -> bool {
        now - self.stored_at < f64::from(ttl)
    }
}

#[derive(Debug, Clone)]
pub struct PerceptionCache {
    l1_ttl: f32,
    l2_ttl: f32,
    l3_ttl: f32,
    l2_min_radius_ratio: f32,
    l1: HashMap<CacheKey, CacheEntry>,
    l2: HashMap<CacheKey, CacheEntry>,
    l3: HashMap<CacheKey, CacheEntry>,
}

impl PerceptionCache {
    pub fn new(config: &PerceptionConfig) -> Self {
        Self {
            l1_ttl: config.l1_ttl,
            l2_ttl: config.l2_ttl,
            l3_ttl: config.l3_ttl,
            l2_min_radius_ratio: config.l2_min_radius_ratio,
            l1: HashMap::new(),
            l2: HashMap::new(),
            l3: HashMap::new(),
        }
    }

    /// Freshest valid answer for a query, checking L1, then L2, then L3.
    ///
    /// `hotspot_cell` is the cell of the hotspot containing the query, if any.
    pub fn lookup(
        &self,
        cell: IVec3,
        faction: Faction,
        radius: f32,
        hotspot_cell: Option<IVec3>,
        now: f64,
        actors: &impl ActorView,
    ) -> Option<(CacheTier, PerceptionResult)> {
        let key = (cell, faction);

        if let Some(result) = self
            .l1
            .get(&key)
            .filter(|e| e.is_fresh(now, self.l1_ttl))
            .and_then(|e| usable(e, actors))
        {
            return Some((CacheTier::L1, result));
        }

        if let Some(result) = self
            .l2
            .get(&key)
            .filter(|e| e.is_fresh(now, self.l2_ttl))
            .filter(|e| e.radius >= radius * self.l2_min_radius_ratio)
            .and_then(|e| usable(e, actors))
        {
            return Some((CacheTier::L2, result));
        }

        let hotspot_cell = hotspot_cell?;
        self.l3
            .get(&(hotspot_cell, faction))
            .filter(|e| e.is_fresh(now, self.l3_ttl))
            .and_then(|e| usable(e, actors))
            .map(|result| (CacheTier::L3, result))
    }

    /// Most recent entry for the key in any tier, ignoring TTL.
    pub fn stale(
        &self,
        cell: IVec3,
        faction: Faction,
        hotspot_cell: Option<IVec3>,
        actors: &impl ActorView,
    ) -> Option<PerceptionResult> {
        let key = (cell, faction);
        let l3 = hotspot_cell.and_then(|c| self.l3.get(&(c, faction)));
        [self.l1.get(&key), self.l2.get(&key), l3]
            .into_iter()
            .flatten()
            .filter_map(|e| usable(e, actors).map(|r| (e.stored_at, r)))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, r)| r)
    }

    /// Store a fresh execution in L1 and L2.
    pub fn store_region(
        &mut self,
        cell: IVec3,
        faction: Faction,
        radius: f32,
        result: &PerceptionResult,
        now: f64,
    ) {
        let entry = CacheEntry {
            result: result.clone(),
            radius,
            stored_at: now,
        };
        self.l1.insert((cell, faction), entry.clone());
        self.l2.insert((cell, faction), entry);
    }

    pub fn store_hotspot(
        &mut self,
        hotspot_cell: IVec3,
        faction: Faction,
        radius: f32,
        result: &PerceptionResult,
        now: f64,
    ) {
        self.l3.insert(
            (hotspot_cell, faction),
            CacheEntry {
                result: result.clone(),
                radius,
                stored_at: now,
            },
        );
    }

    /// Drop every entry past its tier's TTL. Returns how many were removed.
    pub fn purge_expired(&mut self, now: f64) -> usize {
        let before = self.len();
        let (l1_ttl, l2_ttl, l3_ttl) = (self.l1_ttl, self.l2_ttl, self.l3_ttl);
        self.l1.retain(|_, e| e.is_fresh(now, l1_ttl));
        self.l2.retain(|_, e| e.is_fresh(now, l2_ttl));
        self.l3.retain(|_, e| e.is_fresh(now, l3_ttl));
        before - self.len()
    }

    pub fn clear(&mut self) {
        self.l1.clear();
        self.l2.clear();
        self.l3.clear();
    }

    pub fn len(&self) -> usize {
        self.l1.len() + self.l2.len() + self.l3.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tier_len(&self, tier: CacheTier) -> usize {
        match tier {
            CacheTier::L1 => self.l1.len(),
            CacheTier::L2 => self.l2.len(),
            CacheTier::L3 => self.l3.len(),
        }
    }
}

fn usable(entry: &CacheEntry, actors: &impl ActorView) -> Option<PerceptionResult> {
    let cleaned = entry.result.cleaned(actors);
    cleaned.is_valid.then_some(cleaned)
}
