use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use libpicket_core::speed_estimator::SpeedEstimator;

use serde::Serialize;

// Rate window: with a ~10s choker tick this covers ~50s of history.
const SPEED_WINDOW_SNAPSHOTS: usize = 5;

#[derive(Debug, Default)]
pub struct PeerCountersAtomic {
    pub fetched_bytes: AtomicU64,
    pub uploaded_bytes: AtomicU64,
    pub fetched_blocks: AtomicU32,
    pub completed_pieces: AtomicU32,
    pub outstanding_requests: AtomicU32,
}

pub struct PeerStats {
    pub counters: Arc<PeerCountersAtomic>,
    pub down_speed: SpeedEstimator,
    pub up_speed: SpeedEstimator,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            counters: Arc::new(Default::default()),
            down_speed: SpeedEstimator::new(SPEED_WINDOW_SNAPSHOTS),
            up_speed: SpeedEstimator::new(SPEED_WINDOW_SNAPSHOTS),
        }
    }
}

#[derive(Serialize)]
pub struct PeerCounters {
    pub fetched_bytes: u64,
    pub uploaded_bytes: u64,
    pub fetched_blocks: u32,
    pub completed_pieces: u32,
    pub outstanding_requests: u32,
    pub down_bps: u64,
    pub up_bps: u64,
}

impl From<&PeerStats> for PeerCounters {
    fn from(stats: &PeerStats) -> Self {
        let c = stats.counters.as_ref();
        Self {
            fetched_bytes: c.fetched_bytes.load(Ordering::Relaxed),
            uploaded_bytes: c.uploaded_bytes.load(Ordering::Relaxed),
            fetched_blocks: c.fetched_blocks.load(Ordering::Relaxed),
            completed_pieces: c.completed_pieces.load(Ordering::Relaxed),
            outstanding_requests: c.outstanding_requests.load(Ordering::Relaxed),
            down_bps: stats.down_speed.bps(),
            up_bps: stats.up_speed.bps(),
        }
    }
}

#[derive(Serialize)]
pub struct SwarmStatsSnapshot {
    pub total_pieces: u32,
    pub owned_pieces: u32,
    pub inflight_pieces: usize,
    pub endgame: bool,
    pub peers: HashMap<String, PeerCounters>,
}
