use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::time::{Duration, Instant};

use itertools::Itertools;
use tracing::debug;

use crate::peers::PeerStates;
use crate::type_aliases::PeerHandle;

/// Total upload slots; one is reserved for the optimistic rotation.
pub const UNCHOKE_SLOTS: usize = 4;

/// The optimistic slot rotates every N ticks (~30s at a 10s tick).
const OPTIMISTIC_ROTATION_TICKS: u64 = 3;

/// A peer unchoked less than this long ago is "nascent": it keeps its slot
/// while it proves itself, and is only re-choked under slot pressure.
const NASCENT_GRACE: Duration = Duration::from_secs(20);

/// Output of one scheduling pass; the session layer turns this into
/// choke/unchoke wire messages.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokeUpdate {
    pub unchoke: Vec<PeerHandle>,
    pub choke: Vec<PeerHandle>,
}

#[derive(Debug, Default)]
struct UnchokeHistory {
    ever_unchoked: bool,
    last_unchoked_at: Option<Instant>,
    bytes_at_unchoke: u64,
    /// Bytes the peer delivered during its last completed unchoke window.
    /// `Some(0)` halves its elapsed-time weight in the optimistic ranking.
    delivered_last_window: Option<u64>,
}

struct PeerRow {
    handle: PeerHandle,
    interested: bool,
    am_choking: bool,
    am_interested: bool,
    /// Download rate from the peer while leeching, upload rate to it while
    /// seeding.
    rate: u64,
    /// Same substitution for totals.
    total_bytes: u64,
}

/// The reciprocation scheduler. Runs on a seconds-scale tick driven by the
/// session layer; reads only per-peer flags and atomic rate statistics, never
/// the picker's critical section.
pub struct Choker {
    history: HashMap<PeerHandle, UnchokeHistory>,
    optimistic: Option<PeerHandle>,
    ticks: u64,
}

impl Default for Choker {
    fn default() -> Self {
        Self::new()
    }
}

impl Choker {
    pub fn new() -> Self {
        Self {
            history: HashMap::new(),
            optimistic: None,
            ticks: 0,
        }
    }

    pub fn remove_peer(&mut self, handle: PeerHandle) {
        self.history.remove(&handle);
        if self.optimistic == Some(handle) {
            self.optimistic = None;
        }
    }

    /// One scheduling pass: partition connected, interested peers into the
    /// nascent/candidate/optimistic pools, recompute the unchoke set, and
    /// return the diff against current choke state.
    pub fn tick(&mut self, peers: &PeerStates, seeding: bool, now: Instant) -> ChokeUpdate {
        let mut handles = peers.handles();
        handles.sort_unstable();

        let mut rows: Vec<PeerRow> = Vec::with_capacity(handles.len());
        for handle in handles {
            peers.with_peer(handle, |p| {
                let fetched = p.stats.counters.fetched_bytes.load(Relaxed);
                let uploaded = p.stats.counters.uploaded_bytes.load(Relaxed);
                p.stats.down_speed.add_snapshot(fetched, now);
                p.stats.up_speed.add_snapshot(uploaded, now);
                rows.push(PeerRow {
                    handle,
                    interested: p.peer_interested,
                    am_choking: p.am_choking,
                    am_interested: p.am_interested,
                    rate: if seeding {
                        p.stats.up_speed.bps()
                    } else {
                        p.stats.down_speed.bps()
                    },
                    total_bytes: if seeding { uploaded } else { fetched },
                });
            });
        }

        // Departed peers never block scheduling of the rest.
        self.history
            .retain(|h, _| rows.iter().any(|r| r.handle == *h));

        let mut nascent: Vec<&PeerRow> = Vec::new();
        let mut candidates: Vec<&PeerRow> = Vec::new();
        let mut optimistic_pool: Vec<&PeerRow> = Vec::new();
        for r in rows.iter().filter(|r| r.interested) {
            let hist = self.history.entry(r.handle).or_default();
            let is_nascent = !r.am_choking
                && hist
                    .last_unchoked_at
                    .is_some_and(|t| now.duration_since(t) < NASCENT_GRACE);
            if is_nascent {
                nascent.push(r);
            } else if r.rate > 0 {
                candidates.push(r);
            } else {
                optimistic_pool.push(r);
            }
        }

        // Most recently unchoked first; under pressure the front of this
        // list is re-choked first.
        nascent.sort_by_key(|r| std::cmp::Reverse(self.history[&r.handle].last_unchoked_at));

        let regular_slots = UNCHOKE_SLOTS - 1;
        let mut unchoke_set: Vec<PeerHandle> = nascent
            .iter()
            .skip(nascent.len().saturating_sub(regular_slots))
            .map(|r| r.handle)
            .collect();

        let ranked: Vec<&&PeerRow> = if seeding {
            candidates
                .iter()
                .sorted_by_key(|r| (std::cmp::Reverse(r.rate), r.handle))
                .collect()
        } else {
            candidates
                .iter()
                .sorted_by_key(|r| {
                    (
                        std::cmp::Reverse(r.am_interested as u8),
                        std::cmp::Reverse(r.rate),
                        r.handle,
                    )
                })
                .collect()
        };
        for r in ranked {
            if unchoke_set.len() >= regular_slots {
                break;
            }
            unchoke_set.push(r.handle);
        }

        let rotate = self.ticks % OPTIMISTIC_ROTATION_TICKS == 0;
        let current_valid = self
            .optimistic
            .is_some_and(|o| rows.iter().any(|r| r.handle == o && r.interested));
        if rotate || !current_valid {
            self.optimistic = self.pick_optimistic(&optimistic_pool, now);
        }
        if let Some(o) = self.optimistic {
            if !unchoke_set.contains(&o) {
                debug!(peer = o, "optimistic unchoke");
                unchoke_set.push(o);
            }
        }

        let mut update = ChokeUpdate::default();
        for r in &rows {
            let should_unchoke = unchoke_set.contains(&r.handle);
            if should_unchoke == r.am_choking {
                if should_unchoke {
                    update.unchoke.push(r.handle);
                } else {
                    update.choke.push(r.handle);
                }
            }
        }

        for handle in &update.unchoke {
            peers.with_peer_mut(*handle, |p| p.am_choking = false);
            let total = rows
                .iter()
                .find(|r| r.handle == *handle)
                .map(|r| r.total_bytes)
                .unwrap_or(0);
            let hist = self.history.entry(*handle).or_default();
            hist.ever_unchoked = true;
            hist.last_unchoked_at = Some(now);
            hist.bytes_at_unchoke = total;
        }
        for handle in &update.choke {
            peers.with_peer_mut(*handle, |p| p.am_choking = true);
            let total = rows
                .iter()
                .find(|r| r.handle == *handle)
                .map(|r| r.total_bytes)
                .unwrap_or(0);
            let hist = self.history.entry(*handle).or_default();
            hist.delivered_last_window = Some(total.saturating_sub(hist.bytes_at_unchoke));
        }

        self.ticks += 1;
        update
    }

    // Untried peers win the slot outright; among them more transferred bytes
    // first. Previously unchoked peers rank by elapsed time since their last
    // unchoke (halved if that window delivered nothing), then bytes. The
    // ascending handle is the final deterministic tie-break.
    fn pick_optimistic(&self, pool: &[&PeerRow], now: Instant) -> Option<PeerHandle> {
        pool.iter()
            .max_by_key(|r| {
                let hist = &self.history[&r.handle];
                let never_unchoked = !hist.ever_unchoked;
                let weighted_elapsed_ms = match (never_unchoked, hist.last_unchoked_at) {
                    (false, Some(t)) => {
                        let elapsed = now.duration_since(t).as_millis();
                        if hist.delivered_last_window == Some(0) {
                            elapsed / 2
                        } else {
                            elapsed
                        }
                    }
                    _ => 0,
                };
                (
                    never_unchoked,
                    weighted_elapsed_ms,
                    r.total_bytes,
                    std::cmp::Reverse(r.handle),
                )
            })
            .map(|r| r.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Peer;

    fn add_peer(peers: &PeerStates, handle: PeerHandle, interested: bool) {
        let mut p = Peer::new(8, false);
        p.peer_interested = interested;
        p.am_interested = true;
        peers.add(handle, p).unwrap();
    }

    fn set_fetched(peers: &PeerStates, handle: PeerHandle, bytes: u64) {
        peers
            .with_peer(handle, |p| {
                p.stats.counters.fetched_bytes.store(bytes, Relaxed)
            })
            .unwrap();
    }

    fn set_uploaded(peers: &PeerStates, handle: PeerHandle, bytes: u64) {
        peers
            .with_peer(handle, |p| {
                p.stats.counters.uploaded_bytes.store(bytes, Relaxed)
            })
            .unwrap();
    }

    #[test]
    fn test_optimistic_prefers_untried_peer() {
        // X(1) never unchoked; Y(2) unchoked 60s ago, delivered nothing;
        // Z(3) unchoked 30s ago, delivered bytes. X must win outright.
        let peers = PeerStates::default();
        let now = Instant::now();
        for h in [1, 2, 3] {
            add_peer(&peers, h, true);
        }
        set_fetched(&peers, 3, 50_000);

        let mut choker = Choker::new();
        choker.history.insert(
            2,
            UnchokeHistory {
                ever_unchoked: true,
                last_unchoked_at: Some(now - Duration::from_secs(60)),
                bytes_at_unchoke: 0,
                delivered_last_window: Some(0),
            },
        );
        choker.history.insert(
            3,
            UnchokeHistory {
                ever_unchoked: true,
                last_unchoked_at: Some(now - Duration::from_secs(30)),
                bytes_at_unchoke: 0,
                delivered_last_window: Some(50_000),
            },
        );

        let update = choker.tick(&peers, false, now);
        assert_eq!(choker.optimistic, Some(1));
        assert_eq!(update.unchoke, vec![1]);
        assert!(update.choke.is_empty());
    }

    #[test]
    fn test_optimistic_halved_elapsed_tie_breaks_on_bytes() {
        // Same as above without X: Y's halved 60s equals Z's 30s, so the
        // tie falls through to total bytes and Z wins.
        let peers = PeerStates::default();
        let now = Instant::now();
        for h in [2, 3] {
            add_peer(&peers, h, true);
        }
        set_fetched(&peers, 3, 50_000);

        let mut choker = Choker::new();
        choker.history.insert(
            2,
            UnchokeHistory {
                ever_unchoked: true,
                last_unchoked_at: Some(now - Duration::from_secs(60)),
                bytes_at_unchoke: 0,
                delivered_last_window: Some(0),
            },
        );
        choker.history.insert(
            3,
            UnchokeHistory {
                ever_unchoked: true,
                last_unchoked_at: Some(now - Duration::from_secs(30)),
                bytes_at_unchoke: 0,
                delivered_last_window: Some(50_000),
            },
        );

        let update = choker.tick(&peers, false, now);
        assert_eq!(choker.optimistic, Some(3));
        assert_eq!(update.unchoke, vec![3]);
    }

    #[test]
    fn test_departed_optimistic_is_replaced_immediately() {
        let peers = PeerStates::default();
        let now = Instant::now();
        for h in [1, 2] {
            add_peer(&peers, h, true);
        }
        let mut choker = Choker::new();
        let update = choker.tick(&peers, false, now);
        // both untried with zero bytes: lowest handle wins
        assert_eq!(update.unchoke, vec![1]);

        peers.remove(1).unwrap();
        choker.remove_peer(1);

        // next tick is not a rotation tick, but the slot holder is gone
        let update = choker.tick(&peers, false, now + Duration::from_secs(10));
        assert_eq!(choker.optimistic, Some(2));
        assert_eq!(update.unchoke, vec![2]);
    }

    #[test]
    fn test_candidates_ranked_by_download_rate() {
        let peers = PeerStates::default();
        let t0 = Instant::now();
        let rates: [(PeerHandle, u64); 5] =
            [(1, 10_000), (2, 50_000), (3, 20_000), (4, 30_000), (5, 40_000)];
        for (h, _) in rates {
            add_peer(&peers, h, true);
        }

        let mut choker = Choker::new();
        // first pass: no rates yet, everyone lands in the optimistic pool;
        // the untried lowest handle takes the slot
        let update = choker.tick(&peers, false, t0);
        assert_eq!(update.unchoke, vec![1]);

        for (h, bps) in rates {
            set_fetched(&peers, h, bps * 10);
        }
        let update = choker.tick(&peers, false, t0 + Duration::from_secs(10));

        // peer 1 is nascent and keeps its slot; the two remaining regular
        // slots go to the fastest candidates
        assert_eq!(update.unchoke, vec![2, 5]);
        assert!(update.choke.is_empty());
    }

    #[test]
    fn test_candidates_we_are_interested_in_rank_first() {
        let peers = PeerStates::default();
        let t0 = Instant::now();
        for h in [1, 2, 3, 4] {
            add_peer(&peers, h, true);
        }
        // fast peer we are not interested in
        peers.with_peer_mut(2, |p| p.am_interested = false).unwrap();

        let mut choker = Choker::new();
        choker.tick(&peers, false, t0);
        let rates: [(PeerHandle, u64); 4] = [(1, 1_000), (2, 90_000), (3, 2_000), (4, 3_000)];
        for (h, bps) in rates {
            set_fetched(&peers, h, bps * 10);
        }
        let update = choker.tick(&peers, false, t0 + Duration::from_secs(10));

        // 4, 3 outrank the much faster 2 because we want their data;
        // 1 is nascent from the first pass
        assert!(update.unchoke.contains(&4));
        assert!(update.unchoke.contains(&3));
        assert!(!update.unchoke.contains(&2));
    }

    #[test]
    fn test_seeding_ranks_by_upload_rate() {
        let peers = PeerStates::default();
        let t0 = Instant::now();
        for h in [1, 2, 3, 4, 5] {
            add_peer(&peers, h, true);
        }
        let mut choker = Choker::new();
        choker.tick(&peers, true, t0);

        let rates: [(PeerHandle, u64); 5] =
            [(1, 5_000), (2, 1_000), (3, 50_000), (4, 40_000), (5, 2_000)];
        for (h, bps) in rates {
            set_uploaded(&peers, h, bps * 10);
        }
        let update = choker.tick(&peers, true, t0 + Duration::from_secs(10));

        assert!(update.unchoke.contains(&3));
        assert!(update.unchoke.contains(&4));
    }

    #[test]
    fn test_nascent_rechoked_most_recent_first_under_pressure() {
        let peers = PeerStates::default();
        let now = Instant::now();
        for h in [1, 2, 3, 4] {
            add_peer(&peers, h, true);
            peers.with_peer_mut(h, |p| p.am_choking = false).unwrap();
        }
        let mut choker = Choker::new();
        for (h, secs_ago) in [(1u32, 4u64), (2, 8), (3, 12), (4, 16)] {
            choker.history.insert(
                h,
                UnchokeHistory {
                    ever_unchoked: true,
                    last_unchoked_at: Some(now - Duration::from_secs(secs_ago)),
                    bytes_at_unchoke: 0,
                    delivered_last_window: None,
                },
            );
        }

        let update = choker.tick(&peers, false, now);
        // four nascent peers, three regular slots: the most recently
        // unchoked one loses its slot first
        assert_eq!(update.choke, vec![1]);
        assert!(update.unchoke.is_empty());
    }

    #[test]
    fn test_uninterested_unchoked_peer_gets_choked() {
        let peers = PeerStates::default();
        let now = Instant::now();
        add_peer(&peers, 1, false);
        peers.with_peer_mut(1, |p| p.am_choking = false).unwrap();

        let mut choker = Choker::new();
        let update = choker.tick(&peers, false, now);
        assert_eq!(update.choke, vec![1]);
    }
}
