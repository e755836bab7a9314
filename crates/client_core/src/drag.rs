use shared::domain::{TaskId, TaskStatus};
use tracing::debug;

use crate::reconcile::{PendingCall, ReconciliationEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropLocation {
    pub column: TaskStatus,
    pub index: usize,
}

impl DropLocation {
    pub fn new(column: TaskStatus, index: usize) -> Self {
        Self { column, index }
    }
}

/// Result reported by the UI when a drag ends. `destination` is `None` when
/// the card was dropped outside every column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragGesture {
    pub task_id: TaskId,
    pub source: DropLocation,
    pub destination: Option<DropLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveIntent {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragRejection {
    NoDestination,
    Unmoved,
}

/// Columns order the board, not positions inside a column, so the
/// destination index only matters for recognising a drop back in place.
pub fn resolve(gesture: &DragGesture) -> Result<MoveIntent, DragRejection> {
    let destination = gesture.destination.ok_or(DragRejection::NoDestination)?;
    if destination == gesture.source {
        return Err(DragRejection::Unmoved);
    }
    Ok(MoveIntent {
        task_id: gesture.task_id.clone(),
        from: gesture.source.column,
        to: destination.column,
    })
}

/// Applies one finished drag: a single optimistic move plus the call that
/// persists it, or nothing for a cancelled or in-place drop.
pub fn drive(engine: &mut ReconciliationEngine, gesture: &DragGesture) -> Option<PendingCall> {
    match resolve(gesture) {
        Ok(intent) => engine.begin_move(&intent),
        Err(reason) => {
            debug!(task_id = %gesture.task_id, ?reason, "drag ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gesture(source: DropLocation, destination: Option<DropLocation>) -> DragGesture {
        DragGesture {
            task_id: TaskId::from("t1"),
            source,
            destination,
        }
    }

    #[test]
    fn drop_outside_columns_is_rejected() {
        let g = gesture(DropLocation::new(TaskStatus::Todo, 0), None);
        assert_eq!(resolve(&g), Err(DragRejection::NoDestination));
    }

    #[test]
    fn drop_in_place_is_rejected() {
        let here = DropLocation::new(TaskStatus::InProgress, 2);
        assert_eq!(resolve(&gesture(here, Some(here))), Err(DragRejection::Unmoved));
    }

    #[test]
    fn destination_column_becomes_status() {
        let g = gesture(
            DropLocation::new(TaskStatus::Todo, 0),
            Some(DropLocation::new(TaskStatus::Completed, 3)),
        );
        assert_eq!(
            resolve(&g),
            Ok(MoveIntent {
                task_id: TaskId::from("t1"),
                from: TaskStatus::Todo,
                to: TaskStatus::Completed,
            })
        );
    }

    #[test]
    fn drive_issues_one_move_for_a_real_drop() {
        use chrono::Utc;
        use shared::domain::{ProjectId, Task};

        use crate::{config::RollbackPolicy, reconcile::RestCall};

        let mut engine = ReconciliationEngine::new(ProjectId::from("p1"), RollbackPolicy::Snapshot);
        engine.replace_all(vec![Task {
            id: TaskId::from("t1"),
            project_id: None,
            title: "Card".into(),
            description: String::new(),
            status: TaskStatus::Todo,
            assigned_to: None,
            due_date: None,
            created_at: Utc::now(),
        }]);
        let revision = engine.store().revision();

        let cancelled = gesture(DropLocation::new(TaskStatus::Todo, 0), None);
        assert!(drive(&mut engine, &cancelled).is_none());
        assert_eq!(engine.store().revision(), revision);

        let dropped = gesture(
            DropLocation::new(TaskStatus::Todo, 0),
            Some(DropLocation::new(TaskStatus::Completed, 0)),
        );
        let pending = drive(&mut engine, &dropped).expect("one call per drop");
        assert!(matches!(pending.call, RestCall::Update { .. }));
        assert_eq!(engine.store().revision(), revision + 1);
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn reorder_within_column_keeps_status() {
        let g = gesture(
            DropLocation::new(TaskStatus::Todo, 0),
            Some(DropLocation::new(TaskStatus::Todo, 1)),
        );
        assert_eq!(resolve(&g).map(|intent| intent.to), Ok(TaskStatus::Todo));
    }
}
