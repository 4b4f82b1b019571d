//! The lock manager state machine, per §4.4: shared/exclusive resources, FIFO wait queues, and
//! deadlock detection via cycle-detection on a wait-for graph.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::command::CommandResponse;
use crate::command::LockMode;

#[derive(Clone, Debug)]
struct Waiter {
    client_id: String,
    mode: LockMode,
    ts: u64,
}

#[derive(Clone, Debug, Default)]
struct Resource {
    mode: Option<LockMode>,
    holders: BTreeSet<String>,
    waiters: Vec<Waiter>,
}

impl Resource {
    fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

/// Directed graph on client ids: an edge `c -> h` means `c` is blocked waiting on a resource
/// held by `h`. Cycle detection runs a DFS each time an edge is added.
#[derive(Default)]
struct WaitForGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl WaitForGraph {
    fn add_edge(&mut self, from: &str, to: &str) {
        self.edges.entry(from.to_string()).or_default().insert(to.to_string());
    }

    /// Remove every edge originating from `client`, e.g. once it is granted or aborted.
    fn remove_outgoing(&mut self, client: &str) {
        self.edges.remove(client);
    }

    /// Remove every edge pointing at `client`, e.g. once it releases everything it held.
    fn remove_incoming(&mut self, client: &str) {
        for targets in self.edges.values_mut() {
            targets.remove(client);
        }
    }

    /// Find a cycle reachable from `start`, if any, via recursive DFS. Returns the cycle as the
    /// sequence of client ids from the first repeated node back to itself.
    fn find_cycle_from(&self, start: &str) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut rec_stack = BTreeSet::new();
        let mut path = Vec::new();
        self.dfs(start, &mut visited, &mut rec_stack, &mut path)
    }

    fn dfs(&self, node: &str, visited: &mut BTreeSet<String>, rec_stack: &mut BTreeSet<String>, path: &mut Vec<String>) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(neighbors) = self.edges.get(node) {
            for next in neighbors {
                if rec_stack.contains(next) {
                    let start = path.iter().position(|n| n == next).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                if !visited.contains(next) {
                    if let Some(cycle) = self.dfs(next, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}

/// The deterministic, replicated lock table. Every replica runs the exact same sequence of
/// `apply_*` calls in commit order and ends up in identical states.
#[derive(Default)]
pub struct LockManager {
    resources: BTreeMap<String, Resource>,
    graph: WaitForGraph,
    /// Resources currently held by each client, used to resolve `abort`.
    client_holds: BTreeMap<String, BTreeSet<String>>,
    /// Resources each client is currently waiting on, used to resolve `abort`.
    client_waits: BTreeMap<String, BTreeSet<String>>,
    /// The timestamp each client first became a holder of *some* resource it still holds;
    /// cleared once it releases everything. Used to pick a deterministic deadlock victim.
    first_acquired: BTreeMap<String, u64>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `client_id` currently holds `resource`.
    pub fn is_holder(&self, resource: &str, client_id: &str) -> bool {
        self.resources.get(resource).map(|r| r.holders.contains(client_id)).unwrap_or(false)
    }

    /// Whether `client_id` is, or ever was enqueued as a waiter for, `resource` and has since
    /// been removed without becoming a holder (i.e. it was aborted).
    pub fn is_waiting(&self, resource: &str, client_id: &str) -> bool {
        self.resources.get(resource).map(|r| r.waiters.iter().any(|w| w.client_id == client_id)).unwrap_or(false)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_acquire(&mut self, resource: &str, mode: LockMode, client_id: &str, ts: u64) -> CommandResponse {
        let entry = self.resources.entry(resource.to_string()).or_default();

        // A client already holding the resource re-acquiring it is idempotent, not a new wait:
        // without this it would enqueue behind itself, add a self-edge to the wait-for graph,
        // and be reported as its own one-node deadlock cycle. Shared-held clients may re-acquire
        // Shared; Exclusive-held clients may re-acquire either mode, since they already exclude
        // everyone else.
        if entry.holders.contains(client_id) && (mode == LockMode::Shared || entry.mode == Some(LockMode::Exclusive)) {
            return CommandResponse::Acquire {
                granted: true,
                deadlock_victim: None,
            };
        }

        let can_grant_immediately = entry.holders.is_empty() || (mode == LockMode::Shared && entry.mode == Some(LockMode::Shared) && entry.waiters.is_empty());

        if can_grant_immediately {
            entry.mode = Some(mode);
            entry.holders.insert(client_id.to_string());
            self.client_holds.entry(client_id.to_string()).or_default().insert(resource.to_string());
            self.first_acquired.entry(client_id.to_string()).or_insert(ts);
            return CommandResponse::Acquire {
                granted: true,
                deadlock_victim: None,
            };
        }

        let holders: Vec<String> = entry.holders.iter().cloned().collect();
        entry.waiters.push(Waiter {
            client_id: client_id.to_string(),
            mode,
            ts,
        });
        entry.waiters.sort_by_key(|w| w.ts);
        self.client_waits.entry(client_id.to_string()).or_default().insert(resource.to_string());
        for holder in &holders {
            self.graph.add_edge(client_id, holder);
        }

        let deadlock_victim = self.graph.find_cycle_from(client_id).map(|cycle| self.pick_victim(&cycle));

        CommandResponse::Acquire {
            granted: false,
            deadlock_victim,
        }
    }

    /// Deterministically choose which client in a detected cycle to abort: the one with the
    /// largest (most recent) first-acquired timestamp, tiebroken by client id.
    fn pick_victim(&self, cycle: &[String]) -> String {
        cycle
            .iter()
            .max_by_key(|c| (self.first_acquired.get(*c).copied().unwrap_or(0), (*c).clone()))
            .cloned()
            .unwrap_or_else(|| cycle[0].clone())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_release(&mut self, resource: &str, client_id: &str) -> CommandResponse {
        let is_empty_after = {
            let entry = match self.resources.get_mut(resource) {
                Some(entry) => entry,
                None => return CommandResponse::Release,
            };
            entry.holders.remove(client_id);
            if entry.holders.is_empty() {
                entry.mode = None;
            }
            entry.is_empty() && entry.holders.is_empty()
        };
        self.graph.remove_incoming(client_id);
        if let Some(held) = self.client_holds.get_mut(client_id) {
            held.remove(resource);
            if held.is_empty() {
                self.client_holds.remove(client_id);
                self.first_acquired.remove(client_id);
            }
        }

        self.promote_waiters(resource);

        if self.resources.get(resource).map(|r| r.is_empty()).unwrap_or(is_empty_after) {
            self.resources.remove(resource);
        }
        CommandResponse::Release
    }

    /// Promote the FIFO-ordered prefix of `resource`'s waiters that can all coexist: either a
    /// single EXCLUSIVE request, or a maximal run of SHARED requests.
    fn promote_waiters(&mut self, resource: &str) {
        let entry = match self.resources.get_mut(resource) {
            Some(entry) => entry,
            None => return,
        };
        if !entry.holders.is_empty() || entry.waiters.is_empty() {
            return;
        }

        let head_mode = entry.waiters[0].mode;
        let mut promoted = Vec::new();
        match head_mode {
            LockMode::Exclusive => {
                promoted.push(entry.waiters.remove(0));
            }
            LockMode::Shared => {
                while !entry.waiters.is_empty() && entry.waiters[0].mode == LockMode::Shared {
                    promoted.push(entry.waiters.remove(0));
                }
            }
        }

        entry.mode = Some(head_mode);
        for waiter in &promoted {
            entry.holders.insert(waiter.client_id.clone());
            self.client_holds.entry(waiter.client_id.clone()).or_default().insert(resource.to_string());
            self.first_acquired.entry(waiter.client_id.clone()).or_insert(waiter.ts);
            if let Some(waits) = self.client_waits.get_mut(&waiter.client_id) {
                waits.remove(resource);
            }
            self.graph.remove_outgoing(&waiter.client_id);
        }
    }

    /// Release every resource `client_id` holds or waits on, used to resolve a deadlock victim.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_abort(&mut self, client_id: &str) -> CommandResponse {
        let held: Vec<String> = self.client_holds.get(client_id).cloned().unwrap_or_default().into_iter().collect();
        for resource in held {
            self.apply_release(&resource, client_id);
        }

        let waiting: Vec<String> = self.client_waits.remove(client_id).unwrap_or_default().into_iter().collect();
        for resource in waiting {
            if let Some(entry) = self.resources.get_mut(&resource) {
                entry.waiters.retain(|w| w.client_id != client_id);
                if entry.is_empty() {
                    self.resources.remove(&resource);
                }
            }
            self.graph.remove_outgoing(client_id);
        }
        self.graph.remove_incoming(client_id);
        CommandResponse::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_is_exclusive() {
        let mut lm = LockManager::new();
        assert!(matches!(lm.apply_acquire("r", LockMode::Exclusive, "c1", 1), CommandResponse::Acquire { granted: true, .. }));
        assert!(matches!(lm.apply_acquire("r", LockMode::Exclusive, "c2", 2), CommandResponse::Acquire { granted: false, .. }));
        lm.apply_release("r", "c1");
        assert!(lm.is_holder("r", "c2"));
    }

    #[test]
    fn shared_locks_coexist() {
        let mut lm = LockManager::new();
        assert!(matches!(lm.apply_acquire("r", LockMode::Shared, "c1", 1), CommandResponse::Acquire { granted: true, .. }));
        assert!(matches!(lm.apply_acquire("r", LockMode::Shared, "c2", 2), CommandResponse::Acquire { granted: true, .. }));
        assert!(lm.is_holder("r", "c1"));
        assert!(lm.is_holder("r", "c2"));
    }

    #[test]
    fn writer_does_not_starve() {
        let mut lm = LockManager::new();
        lm.apply_acquire("r", LockMode::Shared, "reader1", 1);
        // An exclusive waiter enqueued next must be granted ahead of a later shared request.
        lm.apply_acquire("r", LockMode::Exclusive, "writer", 2);
        lm.apply_acquire("r", LockMode::Shared, "reader2", 3);
        lm.apply_release("r", "reader1");
        assert!(lm.is_holder("r", "writer"));
        assert!(!lm.is_holder("r", "reader2"));
    }

    #[test]
    fn detects_two_cycle_deadlock() {
        let mut lm = LockManager::new();
        lm.apply_acquire("r1", LockMode::Exclusive, "c1", 1);
        lm.apply_acquire("r2", LockMode::Exclusive, "c2", 2);
        let resp = lm.apply_acquire("r2", LockMode::Exclusive, "c1", 3);
        assert!(matches!(resp, CommandResponse::Acquire { deadlock_victim: None, .. }));
        let resp = lm.apply_acquire("r1", LockMode::Exclusive, "c2", 4);
        match resp {
            CommandResponse::Acquire { deadlock_victim: Some(victim), .. } => {
                // c2 first-acquired r2 at ts=2, earlier than c1's ts=1 for r1... c1 is earlier,
                // so the more-recent first-acquire (c2) is chosen as victim.
                assert_eq!(victim, "c2");
            }
            other => panic!("expected a detected deadlock, got {:?}", other),
        }
    }

    #[test]
    fn reacquire_by_existing_holder_is_idempotent_not_a_deadlock() {
        let mut lm = LockManager::new();
        assert!(matches!(lm.apply_acquire("r", LockMode::Exclusive, "c1", 1), CommandResponse::Acquire { granted: true, .. }));
        let resp = lm.apply_acquire("r", LockMode::Exclusive, "c1", 2);
        assert!(matches!(resp, CommandResponse::Acquire { granted: true, deadlock_victim: None }));
        assert!(lm.is_holder("r", "c1"));
        assert!(!lm.is_waiting("r", "c1"));
    }

    #[test]
    fn abort_releases_everything_the_victim_held() {
        let mut lm = LockManager::new();
        lm.apply_acquire("r1", LockMode::Exclusive, "c1", 1);
        lm.apply_abort("c1");
        assert!(!lm.is_holder("r1", "c1"));
    }
}
