//! Turning a migration set and a completed-id set into an ordered work list.

use std::collections::{BTreeMap, BTreeSet};

use crate::discovery::MigrationDescriptor;

/// Which side of a planned migration should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// One entry in a planner's work list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanItem {
    pub id: i64,
    pub direction: Direction,
}

/// A command the planner can turn into a work list.
#[derive(Debug, Clone)]
pub enum Command {
    /// Apply every pending migration, ascending.
    Migrate,
    /// Apply pending migrations strictly below `target`, ascending.
    MigrateUntilJustBefore(i64),
    /// Apply the listed ids, in the given order, skipping any already applied.
    Up(Vec<i64>),
    /// Roll back the listed ids, in the given order, skipping any not applied.
    Down(Vec<i64>),
    /// Roll back the single most recently applied migration.
    Rollback,
    /// Roll back every applied migration above `target`, descending.
    RollbackUntilJustAfter(i64),
    /// Roll back everything applied, then reapply everything pending.
    Reset,
    /// Same selection as `Migrate`, for reporting rather than execution.
    PendingList,
}

/// Compute the ordered work list for `command` given the full migration set
/// `descriptors` and the ids currently recorded as completed.
pub fn plan(
    descriptors: &BTreeMap<i64, MigrationDescriptor>,
    completed: &BTreeSet<i64>,
    command: &Command,
) -> Vec<PlanItem> {
    match command {
        Command::Migrate | Command::PendingList => pending_ascending(descriptors, completed)
            .into_iter()
            .map(|id| PlanItem { id, direction: Direction::Up })
            .collect(),

        Command::MigrateUntilJustBefore(target) => pending_ascending(descriptors, completed)
            .into_iter()
            .filter(|id| id < target)
            .map(|id| PlanItem { id, direction: Direction::Up })
            .collect(),

        Command::Up(ids) => ids
            .iter()
            .filter(|id| !completed.contains(id))
            .map(|&id| PlanItem { id, direction: Direction::Up })
            .collect(),

        Command::Down(ids) => ids
            .iter()
            .filter(|id| completed.contains(id))
            .map(|&id| PlanItem { id, direction: Direction::Down })
            .collect(),

        Command::Rollback => completed
            .iter()
            .next_back()
            .map(|&id| vec![PlanItem { id, direction: Direction::Down }])
            .unwrap_or_default(),

        Command::RollbackUntilJustAfter(target) => completed
            .iter()
            .rev()
            .filter(|id| *id > target)
            .map(|&id| PlanItem { id, direction: Direction::Down })
            .collect(),

        Command::Reset => {
            let mut items: Vec<PlanItem> = completed
                .iter()
                .rev()
                .map(|&id| PlanItem { id, direction: Direction::Down })
                .collect();
            items.extend(
                descriptors
                    .keys()
                    .map(|&id| PlanItem { id, direction: Direction::Up }),
            );
            items
        }
    }
}

fn pending_ascending(
    descriptors: &BTreeMap<i64, MigrationDescriptor>,
    completed: &BTreeSet<i64>,
) -> Vec<i64> {
    descriptors
        .keys()
        .filter(|id| !completed.contains(id))
        .copied()
        .collect()
}
