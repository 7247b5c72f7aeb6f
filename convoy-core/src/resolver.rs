//! Dependency resolution.
//!
//! Orders services into levels with Kahn's algorithm. Level `k` holds the
//! services whose dependencies all sit in levels `< k`, so a level can start
//! concurrently once the previous one is ready.

use crate::error::{ConvoyError, Result};
use crate::manifest::{Manifest, ServiceId};
use serde::Serialize;
use tracing::{debug, instrument};

/// Ordered startup levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupPlan {
    levels: Vec<Vec<ServiceId>>,
}

impl StartupPlan {
    /// Build a plan from explicit levels.
    pub fn from_levels(levels: Vec<Vec<ServiceId>>) -> Self {
        Self { levels }
    }

    /// Levels in startup order.
    pub fn levels(&self) -> &[Vec<ServiceId>] {
        &self.levels
    }

    /// All services, flattened in startup order.
    pub fn services(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.levels.iter().flatten().copied()
    }

    /// Levels in teardown order: the exact reverse of startup.
    pub fn teardown(&self) -> Vec<Vec<ServiceId>> {
        self.levels
            .iter()
            .rev()
            .map(|level| level.iter().rev().copied().collect())
            .collect()
    }

    /// Service names per level, for logs and tests.
    pub fn level_names(&self, manifest: &Manifest) -> Vec<Vec<String>> {
        self.levels.iter().map(|level| manifest.names(level)).collect()
    }
}

/// Order the services of a manifest into startup levels.
///
/// Ties are broken by declaration order. Fails with `CycleDetected` naming
/// the services on the cycle in declaration order.
#[instrument(skip(manifest), fields(project = %manifest.project()))]
pub fn order(manifest: &Manifest) -> Result<StartupPlan> {
    let services = manifest.services();
    let count = services.len();

    let mut in_degree = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];

    // Build graph: dep -> service edge
    for service in services {
        for dep in &service.depends_on {
            dependents[dep.service.index()].push(service.id.index());
            in_degree[service.id.index()] += 1;
        }
    }

    let mut levels: Vec<Vec<ServiceId>> = Vec::new();
    let mut placed = vec![false; count];
    let mut current: Vec<usize> = (0..count).filter(|i| in_degree[*i] == 0).collect();

    while !current.is_empty() {
        let mut next = Vec::new();
        for &node in &current {
            placed[node] = true;
            for &dependent in &dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        levels.push(current.iter().map(|i| services[*i].id).collect());
        current = next;
    }

    if placed.iter().any(|p| !p) {
        let participants = cycle_participants(&placed, &dependents);
        let names = manifest.names(&participants.iter().map(|i| services[*i].id).collect::<Vec<_>>());
        debug!(participants = ?names, "Dependency cycle detected");
        return Err(ConvoyError::CycleDetected { participants: names });
    }

    let plan = StartupPlan { levels };
    debug!(levels = ?plan.level_names(manifest), "Resolved startup order");
    Ok(plan)
}

/// Services left unplaced by Kahn's algorithm, minus those that merely
/// depend on a cycle: repeatedly drop nodes with no dependents left.
fn cycle_participants(placed: &[bool], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut remaining: Vec<bool> = placed.iter().map(|p| !p).collect();

    loop {
        let leaf = (0..remaining.len())
            .find(|&i| remaining[i] && !dependents[i].iter().any(|d| remaining[*d]));
        match leaf {
            Some(i) => remaining[i] = false,
            None => break,
        }
    }

    (0..remaining.len()).filter(|i| remaining[*i]).collect()
}
