use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use shared::{
    domain::{NewTask, ProjectId, Task, TaskId, TaskPatch},
    protocol::{BoardEvent, RoomEvent},
};
use tracing::{debug, warn};

use crate::{
    config::RollbackPolicy,
    drag::MoveIntent,
    store::{BoardSnapshot, BoardStore},
};

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Identifies one in-flight call and the board instance that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    epoch: u64,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Move,
    Edit,
    Delete,
}

impl MutationKind {
    pub fn success_message(self) -> &'static str {
        match self {
            MutationKind::Create => "Task created",
            MutationKind::Move => "Task moved successfully",
            MutationKind::Edit => "Task updated",
            MutationKind::Delete => "Task deleted",
        }
    }

    pub fn failure_message(self) -> &'static str {
        match self {
            MutationKind::Create => "Failed to create task",
            MutationKind::Move => "Failed to move task",
            MutationKind::Edit => "Failed to save task",
            MutationKind::Delete => "Failed to delete task",
        }
    }
}

/// Network call that must follow an optimistic mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestCall {
    Create {
        project_id: ProjectId,
        fields: NewTask,
    },
    Update {
        task_id: TaskId,
        patch: TaskPatch,
    },
    Delete {
        task_id: TaskId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub ticket: Ticket,
    pub kind: MutationKind,
    pub call: RestCall,
}

/// Successful server answer for a [`RestCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Task(Task),
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Confirmed(MutationKind),
    RolledBack { kind: MutationKind, refetch: bool },
    /// The ticket belongs to another board instance or was already settled.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    Duplicate,
    Absent,
    Deleted,
    OtherProject,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Create {
        provisional: Task,
        /// A matching `created` event already put the server's card on the
        /// board, so the provisional one is no longer shown.
        echoed: bool,
    },
    Update {
        task_id: TaskId,
        patch: TaskPatch,
        kind: MutationKind,
    },
    Delete {
        task_id: TaskId,
    },
}

impl PendingOp {
    fn kind(&self) -> MutationKind {
        match self {
            PendingOp::Create { .. } => MutationKind::Create,
            PendingOp::Update { kind, .. } => *kind,
            PendingOp::Delete { .. } => MutationKind::Delete,
        }
    }
}

/// Merges optimistic edits, REST outcomes and push events into one store.
/// A task with calls in flight is shown as its last server copy with the
/// pending patches replayed on top; deleted ids are never re-inserted.
pub struct ReconciliationEngine {
    epoch: u64,
    store: BoardStore,
    rollback: RollbackPolicy,
    next_seq: u64,
    pending: BTreeMap<u64, PendingOp>,
    bases: HashMap<TaskId, Task>,
    tombstones: HashSet<TaskId>,
}

impl ReconciliationEngine {
    pub fn new(project_id: ProjectId, rollback: RollbackPolicy) -> Self {
        Self {
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            store: BoardStore::new(project_id),
            rollback,
            next_seq: 0,
            pending: BTreeMap::new(),
            bases: HashMap::new(),
            tombstones: HashSet::new(),
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        self.store.project_id()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn store(&self) -> &BoardStore {
        &self.store
    }

    pub fn snapshot(&self, connected: bool) -> BoardSnapshot {
        self.store.snapshot(connected)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Full replace from a server listing, keeping in-flight local intent on
    /// top of the fresh data.
    pub fn replace_all(&mut self, tasks: Vec<Task>) {
        let mut fetched = HashSet::new();
        let mut next = Vec::with_capacity(tasks.len());
        for task in tasks {
            if self.tombstones.contains(&task.id) {
                continue;
            }
            fetched.insert(task.id.clone());
            if self.bases.contains_key(&task.id) {
                let id = task.id.clone();
                self.bases.insert(id.clone(), task);
                if let Some(display) = self.project(&id) {
                    next.push(display);
                }
            } else {
                next.push(task);
            }
        }
        self.bases.retain(|id, _| fetched.contains(id));
        next.extend(self.pending.values().filter_map(|op| match op {
            PendingOp::Create {
                provisional,
                echoed: false,
            } => Some(provisional.clone()),
            _ => None,
        }));
        self.store.set_all(next);
    }

    pub fn begin_create(&mut self, fields: NewTask) -> PendingCall {
        let provisional = fields.provisional_task(self.project_id(), Utc::now());
        self.store.upsert(provisional.clone());
        let call = RestCall::Create {
            project_id: self.project_id().clone(),
            fields,
        };
        self.track(
            PendingOp::Create {
                provisional,
                echoed: false,
            },
            call,
        )
    }

    pub fn begin_move(&mut self, intent: &MoveIntent) -> Option<PendingCall> {
        self.begin_update(
            &intent.task_id,
            TaskPatch::status(intent.to),
            MutationKind::Move,
        )
    }

    pub fn begin_edit(&mut self, task_id: &TaskId, patch: TaskPatch) -> Option<PendingCall> {
        if patch.is_empty() {
            debug!(task_id = %task_id, "ignoring empty edit");
            return None;
        }
        self.begin_update(task_id, patch, MutationKind::Edit)
    }

    pub fn begin_delete(&mut self, task_id: &TaskId) -> Option<PendingCall> {
        let current = self.mutable_task(task_id)?.clone();
        self.bases.entry(task_id.clone()).or_insert(current);
        self.store.remove(task_id);
        let call = RestCall::Delete {
            task_id: task_id.clone(),
        };
        Some(self.track(
            PendingOp::Delete {
                task_id: task_id.clone(),
            },
            call,
        ))
    }

    pub fn confirm(&mut self, ticket: Ticket, confirmation: Confirmation) -> Settlement {
        let Some(op) = self.take_pending(ticket) else {
            return Settlement::Stale;
        };
        let kind = op.kind();
        match op {
            PendingOp::Create { provisional, .. } => {
                self.store.remove(&provisional.id);
                match confirmation {
                    Confirmation::Task(canonical) => self.accept_server_copy(canonical),
                    Confirmation::Deleted => {
                        warn!("create confirmed without a task body");
                    }
                }
            }
            PendingOp::Update {
                task_id,
                patch,
                kind,
            } => {
                if self.tombstones.contains(&task_id) {
                    self.forget_if_settled(&task_id);
                    return Settlement::Confirmed(kind);
                }
                match confirmation {
                    Confirmation::Task(canonical) if kind == MutationKind::Edit => {
                        if self.store.contains(&task_id) || self.bases.contains_key(&task_id) {
                            self.accept_server_copy(canonical);
                        } else {
                            self.forget_if_settled(&task_id);
                        }
                    }
                    _ => {
                        // Local state already shows the move; fold it into the base.
                        if let Some(base) = self.bases.get_mut(&task_id) {
                            *base = patch.apply_to(base);
                        }
                        self.refresh(&task_id);
                    }
                }
            }
            PendingOp::Delete { task_id } => {
                self.tombstones.insert(task_id.clone());
                self.bases.remove(&task_id);
            }
        }
        Settlement::Confirmed(kind)
    }

    /// Rejections are always undone locally; with [`RollbackPolicy::Refetch`]
    /// the caller is additionally asked to re-list the project.
    pub fn reject(&mut self, ticket: Ticket) -> Settlement {
        let Some(op) = self.take_pending(ticket) else {
            return Settlement::Stale;
        };
        let kind = op.kind();
        match op {
            PendingOp::Create { provisional, .. } => {
                self.store.remove(&provisional.id);
            }
            PendingOp::Update { task_id, .. } | PendingOp::Delete { task_id } => {
                if self.tombstones.contains(&task_id) {
                    self.forget_if_settled(&task_id);
                } else {
                    self.refresh(&task_id);
                }
            }
        }
        Settlement::RolledBack {
            kind,
            refetch: self.rollback == RollbackPolicy::Refetch,
        }
    }

    pub fn apply_remote(&mut self, room_event: &RoomEvent) -> RemoteOutcome {
        if &room_event.project_id != self.project_id() {
            return RemoteOutcome::OtherProject;
        }
        match &room_event.event {
            BoardEvent::Created(task) => {
                if self.tombstones.contains(&task.id) || self.has_pending_delete(&task.id) {
                    return RemoteOutcome::Deleted;
                }
                if self.store.contains(&task.id) {
                    return RemoteOutcome::Duplicate;
                }
                self.withdraw_echoed_provisional(task);
                self.store.upsert(task.clone());
                RemoteOutcome::Applied
            }
            BoardEvent::Updated(task) => {
                if self.tombstones.contains(&task.id) {
                    return RemoteOutcome::Deleted;
                }
                if self.has_pending_delete(&task.id) {
                    // Keep the fresher copy for a possible rollback, but do
                    // not show it.
                    self.bases.insert(task.id.clone(), task.clone());
                    return RemoteOutcome::Absent;
                }
                if !self.store.contains(&task.id) {
                    return RemoteOutcome::Absent;
                }
                self.accept_server_copy(task.clone());
                RemoteOutcome::Applied
            }
            BoardEvent::Deleted { task_id } => {
                self.tombstones.insert(task_id.clone());
                self.bases.remove(task_id);
                match self.store.remove(task_id) {
                    Some(_) => RemoteOutcome::Applied,
                    None => RemoteOutcome::Absent,
                }
            }
        }
    }

    fn begin_update(
        &mut self,
        task_id: &TaskId,
        patch: TaskPatch,
        kind: MutationKind,
    ) -> Option<PendingCall> {
        let current = self.mutable_task(task_id)?.clone();
        self.bases.entry(task_id.clone()).or_insert(current.clone());
        let optimistic = patch.apply_to(&current);
        // Always one store write per accepted gesture, even when the status
        // is unchanged.
        self.store.upsert(optimistic);
        let call = RestCall::Update {
            task_id: task_id.clone(),
            patch: patch.clone(),
        };
        Some(self.track(
            PendingOp::Update {
                task_id: task_id.clone(),
                patch,
                kind,
            },
            call,
        ))
    }

    fn mutable_task(&self, task_id: &TaskId) -> Option<&Task> {
        if task_id.is_provisional() {
            warn!(task_id = %task_id, "task is still being created");
            return None;
        }
        let task = self.store.get(task_id);
        if task.is_none() {
            warn!(task_id = %task_id, "task is not on this board");
        }
        task
    }

    fn track(&mut self, op: PendingOp, call: RestCall) -> PendingCall {
        self.next_seq += 1;
        let ticket = Ticket {
            epoch: self.epoch,
            seq: self.next_seq,
        };
        let kind = op.kind();
        self.pending.insert(ticket.seq, op);
        PendingCall { ticket, kind, call }
    }

    fn take_pending(&mut self, ticket: Ticket) -> Option<PendingOp> {
        if ticket.epoch != self.epoch {
            debug!(
                ticket_epoch = ticket.epoch,
                board_epoch = self.epoch,
                "discarding completion for a closed board"
            );
            return None;
        }
        self.pending.remove(&ticket.seq)
    }

    fn has_pending_delete(&self, task_id: &TaskId) -> bool {
        self.pending
            .values()
            .any(|op| matches!(op, PendingOp::Delete { task_id: id } if id == task_id))
    }

    /// Hides the oldest unechoed provisional card that `created` describes.
    /// The pending create still settles normally.
    fn withdraw_echoed_provisional(&mut self, created: &Task) {
        let claimed = self.pending.values_mut().find_map(|op| match op {
            PendingOp::Create {
                provisional,
                echoed,
            } if !*echoed && describes_same_card(provisional, created) => {
                *echoed = true;
                Some(provisional.id.clone())
            }
            _ => None,
        });
        if let Some(provisional) = claimed {
            debug!(task_id = %created.id, provisional = %provisional, "created echo replaces provisional card");
            self.store.remove(&provisional);
        }
    }

    fn has_pending_ops(&self, task_id: &TaskId) -> bool {
        self.pending.values().any(|op| match op {
            PendingOp::Update { task_id: id, .. } | PendingOp::Delete { task_id: id } => {
                id == task_id
            }
            PendingOp::Create { .. } => false,
        })
    }

    /// Base with every pending patch replayed; `None` while a delete is in
    /// flight or when nothing is known about the task.
    fn project(&self, task_id: &TaskId) -> Option<Task> {
        if self.has_pending_delete(task_id) {
            return None;
        }
        let base = self.bases.get(task_id)?;
        let projected = self
            .pending
            .values()
            .filter_map(|op| match op {
                PendingOp::Update {
                    task_id: id, patch, ..
                } if id == task_id => Some(patch),
                _ => None,
            })
            .fold(base.clone(), |task, patch| patch.apply_to(&task));
        Some(projected)
    }

    /// Makes the store show the projected copy, writing only on change.
    fn refresh(&mut self, task_id: &TaskId) {
        match self.project(task_id) {
            Some(display) => {
                if self.store.get(task_id) != Some(&display) {
                    self.store.upsert(display);
                }
            }
            None if self.has_pending_delete(task_id) => {
                self.store.remove(task_id);
            }
            None => {}
        }
        self.forget_if_settled(task_id);
    }

    fn forget_if_settled(&mut self, task_id: &TaskId) {
        if !self.has_pending_ops(task_id) {
            self.bases.remove(task_id);
        }
    }

    fn accept_server_copy(&mut self, task: Task) {
        if self.tombstones.contains(&task.id) {
            debug!(task_id = %task.id, "ignoring server copy of a deleted task");
            return;
        }
        if self.has_pending_ops(&task.id) {
            let id = task.id.clone();
            self.bases.insert(id.clone(), task);
            self.refresh(&id);
        } else {
            self.bases.remove(&task.id);
            self.store.upsert(task);
        }
    }
}

fn describes_same_card(provisional: &Task, created: &Task) -> bool {
    provisional.title == created.title
        && provisional.description == created.description
        && provisional.status == created.status
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
