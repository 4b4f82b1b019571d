//! The MESI-style cache coherence state machine, per §4.6.
//!
//! Each node owns a local, bounded LRU of cache lines; the leader additionally maintains a
//! directory mapping each key to the set of nodes currently holding a copy. `CacheManager`
//! models exactly one node's view: its own local lines, plus the (replicated, but
//! leader-authoritative) directory.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use raft::NodeId;

use crate::command::CommandResponse;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CacheState {
    Modified,
    Exclusive,
    Shared,
}

#[derive(Clone, Debug)]
struct CacheLine {
    value: Vec<u8>,
    state: CacheState,
    last_access_ts: u64,
    access_count: u64,
}

/// A dirty line evicted or invalidated out from under a modified state, which the caller must
/// persist to the durable store before it is truly gone.
pub struct WriteBack {
    pub key: String,
    pub value: Vec<u8>,
}

pub struct CacheManager {
    node_id: NodeId,
    capacity_bytes: u64,
    lines: BTreeMap<String, CacheLine>,
    /// Least-recently-used order, oldest first.
    order: VecDeque<String>,
    /// Leader-authoritative; followers keep the same structure up to date via the same applied
    /// commands; they just never act as routing authority on it. Tracks each sharer's *known*
    /// state, not just membership, so a remote read can find and downgrade an existing
    /// Modified/Exclusive owner per §4.6.
    directory: BTreeMap<String, BTreeMap<NodeId, CacheState>>,
}

impl CacheManager {
    pub fn new(node_id: NodeId, capacity_mb: u64) -> Self {
        Self {
            node_id,
            capacity_bytes: capacity_mb * 1024 * 1024,
            lines: BTreeMap::new(),
            order: VecDeque::new(),
            directory: BTreeMap::new(),
        }
    }

    /// A hit if the key has any locally cached line at all; state `I` is simply absence.
    pub fn local_read(&mut self, key: &str, now_ts: u64) -> Option<Vec<u8>> {
        if let Some(line) = self.lines.get_mut(key) {
            line.last_access_ts = now_ts;
            line.access_count += 1;
            touch(&mut self.order, key);
            Some(line.value.clone())
        } else {
            None
        }
    }

    pub fn local_state(&self, key: &str) -> Option<CacheState> {
        self.lines.get(key).map(|l| l.state)
    }

    /// The sharers of `key` other than `except_node`, as known to the directory. Only
    /// meaningful when called on the leader.
    pub fn sharers_excluding(&self, key: &str, except_node: NodeId) -> Vec<NodeId> {
        self.directory.get(key).map(|m| m.keys().copied().filter(|&n| n != except_node).collect()).unwrap_or_default()
    }

    /// The node other than `requester` that the directory believes holds `key` as Modified or
    /// Exclusive, if any. By the coherence invariant there is at most one. The leader must
    /// downgrade this node to Shared before a remote reader installs its own copy.
    pub fn owner_to_downgrade(&self, key: &str, requester: NodeId) -> Option<NodeId> {
        self.directory.get(key).and_then(|sharers| {
            sharers
                .iter()
                .find(|&(&node, &state)| node != requester && matches!(state, CacheState::Modified | CacheState::Exclusive))
                .map(|(&node, _)| node)
        })
    }

    /// Install a freshly fetched line as Exclusive or Shared, evicting as needed to stay under
    /// the byte budget. Returns any dirty line that eviction wrote out.
    pub fn install(&mut self, key: &str, value: Vec<u8>, state: CacheState, now_ts: u64) -> Vec<WriteBack> {
        self.lines.insert(
            key.to_string(),
            CacheLine {
                value,
                state,
                last_access_ts: now_ts,
                access_count: 1,
            },
        );
        touch(&mut self.order, key);
        self.evict_if_needed()
    }

    fn estimate_size_bytes(&self) -> u64 {
        // Mirrors the reference implementation's simplified per-entry estimate rather than
        // summing actual value lengths.
        self.lines.len() as u64 * 1024
    }

    fn evict_if_needed(&mut self) -> Vec<WriteBack> {
        let mut writebacks = Vec::new();
        while self.estimate_size_bytes() > self.capacity_bytes {
            let victim = match self.order.pop_front() {
                Some(k) => k,
                None => break,
            };
            if let Some(line) = self.lines.remove(&victim) {
                if line.state == CacheState::Modified {
                    writebacks.push(WriteBack { key: victim, value: line.value });
                }
            }
        }
        writebacks
    }

    fn invalidate_local(&mut self, key: &str) -> Option<WriteBack> {
        let line = self.lines.remove(key)?;
        self.order.retain(|k| k != key);
        if line.state == CacheState::Modified {
            Some(WriteBack {
                key: key.to_string(),
                value: line.value,
            })
        } else {
            None
        }
    }

    /// Apply a committed `write(key, value, writer_node)`. On the writer's own replica this
    /// installs the line as Modified; every other replica invalidates its copy, per the
    /// write-invalidate rule.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub fn apply_write(&mut self, key: &str, value: Vec<u8>, writer_node: NodeId, now_ts: u64) -> (CommandResponse, Vec<WriteBack>) {
        let mut writebacks = Vec::new();
        if writer_node == self.node_id {
            self.lines.insert(
                key.to_string(),
                CacheLine {
                    value,
                    state: CacheState::Modified,
                    last_access_ts: now_ts,
                    access_count: 1,
                },
            );
            touch(&mut self.order, key);
            writebacks.extend(self.evict_if_needed());
        } else if let Some(wb) = self.invalidate_local(key) {
            writebacks.push(wb);
        }
        self.directory.insert(key.to_string(), std::iter::once((writer_node, CacheState::Modified)).collect());
        (CommandResponse::CacheWrite, writebacks)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_register(&mut self, key: &str, node: NodeId, state: CacheState) -> CommandResponse {
        self.directory.entry(key.to_string()).or_default().insert(node, state);
        CommandResponse::CacheRegister
    }

    /// Apply a committed `invalidate(key, except)`. Every replica other than `except` drops its
    /// local line; the directory is trimmed to just `except`, if any.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_invalidate(&mut self, key: &str, except: Option<NodeId>) -> (CommandResponse, Option<WriteBack>) {
        let wb = if Some(self.node_id) != except { self.invalidate_local(key) } else { None };
        match except {
            Some(node) => {
                let state = self.directory.get(key).and_then(|m| m.get(&node).copied()).unwrap_or(CacheState::Exclusive);
                self.directory.insert(key.to_string(), std::iter::once((node, state)).collect());
            }
            None => {
                self.directory.remove(key);
            }
        }
        (CommandResponse::CacheInvalidate, wb)
    }

    /// Apply a committed `write_back(key, value)`: the value is durably persisted by the
    /// dispatcher; locally this just clears the dirty bit by downgrading Modified to Shared (a
    /// remote read triggered the write-back). Eviction-triggered write-backs have already
    /// removed the line by the time this runs.
    #[tracing::instrument(level = "debug", skip(self, _value))]
    pub fn apply_write_back(&mut self, key: &str, _value: &[u8]) -> CommandResponse {
        if let Some(line) = self.lines.get_mut(key) {
            if line.state == CacheState::Modified {
                line.state = CacheState::Shared;
            }
        }
        CommandResponse::CacheWriteBack
    }

    /// Apply a committed `downgrade(key, node)`: per the §4.6 remote-read rule, `node`'s copy of
    /// `key` drops from Modified or Exclusive to Shared. Only the owning replica has a local
    /// line to touch; every replica updates its view of the directory the same way.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_downgrade(&mut self, key: &str, node: NodeId) -> (CommandResponse, Option<WriteBack>) {
        let mut wb = None;
        if node == self.node_id {
            if let Some(line) = self.lines.get_mut(key) {
                if line.state == CacheState::Modified {
                    wb = Some(WriteBack {
                        key: key.to_string(),
                        value: line.value.clone(),
                    });
                }
                line.state = CacheState::Shared;
            }
        }
        self.directory.entry(key.to_string()).or_default().insert(node, CacheState::Shared);
        (CommandResponse::CacheDowngrade, wb)
    }
}

fn touch(order: &mut VecDeque<String>, key: &str) {
    order.retain(|k| k != key);
    order.push_back(key.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_miss_then_install_is_a_hit() {
        let mut cache = CacheManager::new(1, 256);
        assert_eq!(cache.local_read("k", 1), None);
        cache.install("k", b"v".to_vec(), CacheState::Exclusive, 1);
        assert_eq!(cache.local_read("k", 2), Some(b"v".to_vec()));
    }

    #[test]
    fn write_installs_modified_on_writer_and_invalidates_elsewhere() {
        let mut writer = CacheManager::new(1, 256);
        let mut other = CacheManager::new(2, 256);
        other.install("k", b"old".to_vec(), CacheState::Shared, 1);

        let (resp, wbs) = writer.apply_write("k", b"new".to_vec(), 1, 2);
        assert!(matches!(resp, CommandResponse::CacheWrite));
        assert!(wbs.is_empty());
        assert_eq!(writer.local_state("k"), Some(CacheState::Modified));

        let (_, wbs) = other.apply_write("k", b"new".to_vec(), 1, 2);
        assert!(wbs.is_empty());
        assert_eq!(other.local_state("k"), None);
    }

    #[test]
    fn evicting_a_modified_line_yields_a_write_back() {
        let mut cache = CacheManager::new(1, 0);
        let (_, wbs) = cache.apply_write("k", b"dirty".to_vec(), 1, 1);
        assert_eq!(wbs.len(), 1);
        assert_eq!(wbs[0].key, "k");
    }

    #[test]
    fn directory_tracks_sharers() {
        let mut cache = CacheManager::new(1, 256);
        cache.apply_register("k", 2, CacheState::Shared);
        cache.apply_register("k", 3, CacheState::Shared);
        let sharers = cache.sharers_excluding("k", 2);
        assert_eq!(sharers, vec![3]);
    }

    #[test]
    fn remote_read_downgrades_modified_owner_to_shared() {
        let mut owner = CacheManager::new(1, 256);
        owner.apply_write("k", b"dirty".to_vec(), 1, 1);
        assert_eq!(owner.local_state("k"), Some(CacheState::Modified));

        let owner_to_downgrade = owner.owner_to_downgrade("k", 2);
        assert_eq!(owner_to_downgrade, Some(1));

        let (_, wb) = owner.apply_downgrade("k", 1);
        assert_eq!(owner.local_state("k"), Some(CacheState::Shared));
        assert_eq!(wb.map(|w| w.value), Some(b"dirty".to_vec()));
        assert_eq!(owner.owner_to_downgrade("k", 2), None);
    }

    #[test]
    fn remote_read_downgrades_exclusive_owner_without_a_write_back() {
        let mut owner = CacheManager::new(1, 256);
        owner.install("k", b"v".to_vec(), CacheState::Exclusive, 1);
        owner.apply_register("k", 1, CacheState::Exclusive);

        let (_, wb) = owner.apply_downgrade("k", 1);
        assert_eq!(owner.local_state("k"), Some(CacheState::Shared));
        assert!(wb.is_none());
    }
}
