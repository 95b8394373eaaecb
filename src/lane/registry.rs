//! Per-run store of every lane, terminal ones included.

use std::collections::HashMap;

use super::{Lane, LaneId, LaneStatus};
use crate::core::NodeId;
use crate::error::{Error, Result};

/// Owns the lanes of one orchestration run and the run's sequence counters.
#[derive(Debug, Default)]
pub struct LaneRegistry {
    lanes: Vec<Lane>,
    index: HashMap<LaneId, usize>,
    next_lane_seq: u64,
    /// Number of merges committed so far in this run.
    merge_seq: u64,
    verify_seq: u64,
}

impl LaneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> LaneId {
        self.next_lane_seq += 1;
        LaneId::generate(self.next_lane_seq)
    }

    /// Queue a fresh lane for `node_id`, provisioned against the current merge state.
    pub fn create(&mut self, node_id: &NodeId, max_failures: u32) -> LaneId {
        let id = self.next_id();
        let mut lane = Lane::new(id.clone(), node_id.clone(), max_failures);
        lane.base_merge_seq = self.merge_seq;
        self.insert(lane);
        id
    }

    /// Queue a replacement for a lane sitting in PENDING_RECONCILIATION.
    pub fn create_reconciliation(&mut self, stale: &LaneId) -> Result<LaneId> {
        let id = self.next_id();
        let stale = self.get(stale).ok_or_else(|| unknown(stale))?;
        let mut lane = Lane::reconciliation(id.clone(), stale)?;
        lane.base_merge_seq = self.merge_seq;
        self.insert(lane);
        Ok(id)
    }

    /// Insert a lane, replacing any stored lane with the same id.
    pub fn insert(&mut self, lane: Lane) {
        match self.index.get(&lane.lane_id) {
            Some(&pos) => self.lanes[pos] = lane,
            None => {
                self.index.insert(lane.lane_id.clone(), self.lanes.len());
                self.lanes.push(lane);
            }
        }
    }

    pub fn get(&self, id: &LaneId) -> Option<&Lane> {
        self.index.get(id).map(|&pos| &self.lanes[pos])
    }

    pub fn get_mut(&mut self, id: &LaneId) -> Option<&mut Lane> {
        match self.index.get(id) {
            Some(&pos) => Some(&mut self.lanes[pos]),
            None => None,
        }
    }

    pub fn require_mut(&mut self, id: &LaneId) -> Result<&mut Lane> {
        self.get_mut(id).ok_or_else(|| unknown(id))
    }

    /// All lanes in creation order.
    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn with_status(&self, status: LaneStatus) -> impl Iterator<Item = &Lane> {
        self.lanes.iter().filter(move |l| l.status == status)
    }

    pub fn for_node<'a>(&'a self, node_id: &'a NodeId) -> impl Iterator<Item = &'a Lane> {
        self.lanes.iter().filter(move |l| &l.node_id == node_id)
    }

    /// Reconciliation lanes spawned so far for `node_id`.
    pub fn reconciliations_for(&self, node_id: &NodeId) -> u32 {
        self.for_node(node_id)
            .filter(|l| l.spawned_from.is_some())
            .count() as u32
    }

    /// VERIFIED lanes in merge-queue order.
    pub fn verified_queue(&self) -> Vec<LaneId> {
        let mut verified: Vec<&Lane> = self.with_status(LaneStatus::Verified).collect();
        verified.sort_by_key(|l| l.verified_seq.unwrap_or(u64::MAX));
        verified.into_iter().map(|l| l.lane_id.clone()).collect()
    }

    pub fn current_merge_seq(&self) -> u64 {
        self.merge_seq
    }

    pub fn next_merge_seq(&mut self) -> u64 {
        self.merge_seq += 1;
        self.merge_seq
    }

    pub fn next_verify_seq(&mut self) -> u64 {
        self.verify_seq += 1;
        self.verify_seq
    }

    pub fn into_lanes(self) -> Vec<Lane> {
        self.lanes
    }
}

fn unknown(id: &LaneId) -> Error {
    Error::Validation(format!("lane {} not found", id))
}
