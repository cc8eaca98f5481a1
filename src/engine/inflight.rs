use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};

use petgraph::graph::NodeIndex;

use crate::task::TaskId;

/// A task as owned by a particular engine.
pub(crate) type Slot = (NodeIndex, TaskId);

/// Bookkeeping for evaluations that are currently in progress, shared by all
/// sessions of a workbench.
///
/// Two things live here. `running` makes sure a task is checked or executed
/// by at most one thread at a time. `waits` is the graph of "A is waiting for
/// B" edges; an edge is added before a requirement can block, and adding an
/// edge that closes a loop is refused, which turns what would otherwise be a
/// deadlock into a reported cycle.
#[derive(Default)]
pub(crate) struct InFlight {
    running: Mutex<HashSet<Slot>>,
    freed: Condvar,
    waits: Mutex<HashMap<Slot, HashMap<Slot, usize>>>,
}

impl InFlight {
    /// Records that `from` requires `to`. On a cycle, returns the offending
    /// path, starting and ending at `from`.
    pub(crate) fn wait<'a>(
        &'a self,
        from: Option<&Slot>,
        to: &Slot,
    ) -> Result<WaitGuard<'a>, Vec<TaskId>> {
        let Some(from) = from else {
            return Ok(WaitGuard { inflight: self, edge: None });
        };

        let mut waits = self.waits.lock().unwrap_or_else(|e| e.into_inner());

        if from == to {
            return Err(vec![from.1.clone(), to.1.clone()]);
        }

        if let Some(trail) = find_path(&waits, to, from) {
            let mut cycle = Vec::with_capacity(trail.len() + 1);
            cycle.push(from.1.clone());
            cycle.extend(trail.into_iter().map(|slot| slot.1.clone()));
            return Err(cycle);
        }

        *waits
            .entry(from.clone())
            .or_default()
            .entry(to.clone())
            .or_default() += 1;

        Ok(WaitGuard {
            inflight: self,
            edge: Some((from.clone(), to.clone())),
        })
    }

    /// Blocks until no other thread works on `slot`, then claims it.
    pub(crate) fn claim<'a>(&'a self, slot: &Slot) -> ClaimGuard<'a> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        while running.contains(slot) {
            running = self.freed.wait(running).unwrap_or_else(|e| e.into_inner());
        }
        running.insert(slot.clone());

        ClaimGuard {
            inflight: self,
            slot: slot.clone(),
        }
    }
}

/// Depth-first search over the wait graph, returning the slots visited on
/// the way from `start` to `goal`, both included.
fn find_path(
    waits: &HashMap<Slot, HashMap<Slot, usize>>,
    start: &Slot,
    goal: &Slot,
) -> Option<Vec<Slot>> {
    let mut visited = HashSet::new();
    let mut trail = vec![start.clone()];

    fn visit(
        waits: &HashMap<Slot, HashMap<Slot, usize>>,
        goal: &Slot,
        visited: &mut HashSet<Slot>,
        trail: &mut Vec<Slot>,
    ) -> bool {
        let Some(current) = trail.last().cloned() else {
            return false;
        };

        if &current == goal {
            return true;
        }

        if !visited.insert(current.clone()) {
            return false;
        }

        for next in waits.get(&current).into_iter().flat_map(HashMap::keys) {
            trail.push(next.clone());
            if visit(waits, goal, visited, trail) {
                return true;
            }
            trail.pop();
        }

        false
    }

    visit(waits, goal, &mut visited, &mut trail).then_some(trail)
}

pub(crate) struct WaitGuard<'a> {
    inflight: &'a InFlight,
    edge: Option<(Slot, Slot)>,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let Some((from, to)) = self.edge.take() else {
            return;
        };

        let mut waits = self.inflight.waits.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(targets) = waits.get_mut(&from) {
            if let Some(count) = targets.get_mut(&to) {
                *count -= 1;
                if *count == 0 {
                    targets.remove(&to);
                }
            }
            if targets.is_empty() {
                waits.remove(&from);
            }
        }
    }
}

pub(crate) struct ClaimGuard<'a> {
    inflight: &'a InFlight,
    slot: Slot,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.inflight.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.slot);
        self.inflight.freed.notify_all();
    }
}
