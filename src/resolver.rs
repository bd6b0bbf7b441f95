//! Dependency Resolver - orders pending work against recorded history
//!
//! Turns a set of definitions plus the ledger's executed set into a
//! deterministic execution plan: a topologically sorted pending list, a
//! blocked list with reasons, and a cycle report when no order exists.
//! Ties between ready migrations always break by version ascending, never
//! by registration order, so the plan is reproducible across re-registrations.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::definitions::{BlockedMigration, Migration};

/// The resolver's output for one snapshot of registry + ledger state.
#[derive(Clone)]
pub struct MigrationPlan {
    /// Runnable migrations in execution order.
    pub pending: Vec<Arc<dyn Migration>>,
    /// Registered, not executed, and currently unsatisfiable.
    pub blocked: Vec<BlockedMigration>,
    /// When set, the graph contains a cycle and the plan is not executable.
    pub cycle: Option<Vec<String>>,
}

impl MigrationPlan {
    /// True when every registered migration is either executed or pending.
    pub fn is_clean(&self) -> bool {
        self.blocked.is_empty() && self.cycle.is_none()
    }
}

/// Computes a total execution order from a partial dependency graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Build the plan for `migrations` given the ids the ledger records as executed.
    ///
    /// Never panics and never errors: unknown dependency ids classify the
    /// dependent as blocked, and cycles are reported in
    /// [`MigrationPlan::cycle`] rather than dropped, so read paths stay
    /// usable on degraded state. Callers that need a hard failure (the run
    /// path) inspect `cycle` themselves.
    pub fn plan(
        &self,
        migrations: &[Arc<dyn Migration>],
        executed: &HashSet<String>,
    ) -> MigrationPlan {
        let known: HashSet<&str> = migrations.iter().map(|m| m.id()).collect();
        let by_id: HashMap<&str, &Arc<dyn Migration>> =
            migrations.iter().map(|m| (m.id(), m)).collect();

        let remaining: Vec<&Arc<dyn Migration>> = migrations
            .iter()
            .filter(|m| !executed.contains(m.id()))
            .collect();

        // Dependents within the remaining set, for propagation and for Kahn.
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for m in &remaining {
            for dep in m.dependencies() {
                dependents.entry(dep.as_str()).or_default().push(m.id());
            }
        }

        // A dependency that is neither executed nor registered can never be
        // satisfied; the dependent is blocked, and so is everything above it.
        let mut blocked_reasons: HashMap<String, String> = HashMap::new();
        let mut queue: Vec<&str> = Vec::new();
        for m in &remaining {
            if let Some(dep) = m
                .dependencies()
                .iter()
                .find(|d| !executed.contains(d.as_str()) && !known.contains(d.as_str()))
            {
                blocked_reasons.insert(
                    m.id().to_string(),
                    format!("depends on unknown migration '{}'", dep),
                );
                queue.push(m.id());
            }
        }
        while let Some(blocked_id) = queue.pop() {
            for dependent in dependents.get(blocked_id).cloned().unwrap_or_default() {
                if !blocked_reasons.contains_key(dependent) {
                    blocked_reasons.insert(
                        dependent.to_string(),
                        format!("depends on blocked migration '{}'", blocked_id),
                    );
                    queue.push(dependent);
                }
            }
        }

        // Kahn's algorithm over the sortable subset. The ready set is kept
        // ordered by (version, id) so the order is stable across calls.
        let sortable: HashSet<&str> = remaining
            .iter()
            .map(|m| m.id())
            .filter(|id| !blocked_reasons.contains_key(*id))
            .collect();

        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for id in &sortable {
            let unresolved = by_id[id]
                .dependencies()
                .iter()
                .filter(|d| sortable.contains(d.as_str()))
                .count();
            indegree.insert(*id, unresolved);
        }

        let mut ready: BTreeSet<(&str, &str)> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| (by_id[*id].version(), *id))
            .collect();

        let mut pending: Vec<Arc<dyn Migration>> = Vec::new();
        while let Some((_version, id)) = ready.pop_first() {
            pending.push(Arc::clone(by_id[id]));
            for dependent in dependents.get(id).cloned().unwrap_or_default() {
                if let Some(deg) = indegree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert((by_id[dependent].version(), dependent));
                    }
                }
            }
        }

        // Anything sortable that never became ready sits on or behind a cycle.
        let leftover: BTreeSet<&str> = sortable
            .iter()
            .filter(|id| !pending.iter().any(|m| m.id() == **id))
            .copied()
            .collect();
        let cycle = if leftover.is_empty() {
            None
        } else {
            for id in &leftover {
                blocked_reasons.insert(
                    id.to_string(),
                    "part of or dependent on a dependency cycle".to_string(),
                );
            }
            Some(find_cycle(&leftover, &by_id))
        };

        let mut blocked: Vec<BlockedMigration> = blocked_reasons
            .into_iter()
            .map(|(id, reason)| {
                let m = by_id[id.as_str()];
                BlockedMigration {
                    id,
                    version: m.version().to_string(),
                    name: m.name().to_string(),
                    reason,
                }
            })
            .collect();
        blocked.sort_by(|a, b| (&a.version, &a.id).cmp(&(&b.version, &b.id)));

        MigrationPlan {
            pending,
            blocked,
            cycle,
        }
    }
}

/// Walk dependency edges inside `leftover` until a node repeats; the slice
/// from its first occurrence is a concrete cycle, reported with the starting
/// node repeated at the end.
fn find_cycle(leftover: &BTreeSet<&str>, by_id: &HashMap<&str, &Arc<dyn Migration>>) -> Vec<String> {
    let Some(&start) = leftover.iter().next() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    let mut seen: HashMap<&str, usize> = HashMap::new();
    seen.insert(start, 0);

    let mut current = start;
    loop {
        let next = by_id[current]
            .dependencies()
            .iter()
            .map(|d| d.as_str())
            .find(|d| leftover.contains(d));
        let Some(next) = next else {
            // Dependent on a cycle without being on it; report the tail we saw.
            return path.iter().map(|s| s.to_string()).collect();
        };
        if let Some(&pos) = seen.get(next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
