use std::sync::Arc;

use shared::{
    domain::{validate_title, NewTask, ProjectId, Task, TaskId, TaskPatch},
    protocol::{EventKind, RoomEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, Subscription},
    config::Settings,
    drag::{self, DragGesture},
    error::{ApiFailure, BoardError},
    reconcile::{Confirmation, PendingCall, ReconciliationEngine, RestCall, Settlement, Ticket},
    rest::TaskApi,
    store::BoardSnapshot,
};

/// Transient user-facing message about a finished mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardNotice {
    Success(String),
    Failure(String),
}

#[derive(Debug)]
enum Command {
    Drag(DragGesture),
    Create(NewTask),
    Edit(TaskId, TaskPatch),
    Delete(TaskId),
    Refetch,
    Close,
}

enum Input {
    Remote(RoomEvent),
    Settled {
        ticket: Ticket,
        result: Result<Confirmation, ApiFailure>,
    },
    Loaded {
        request: u64,
        result: Result<Vec<Task>, ApiFailure>,
    },
}

/// Opens a board whose engine is owned by a single task; every input is
/// applied there one at a time.
pub struct BoardView;

impl BoardView {
    /// Joins the project's room, starts the initial load and returns the
    /// handle driving the board. Must be called inside a tokio runtime.
    pub fn open(
        project_id: ProjectId,
        api: Arc<dyn TaskApi>,
        channel: Arc<Channel>,
        settings: &Settings,
    ) -> BoardHandle {
        let engine = ReconciliationEngine::new(project_id.clone(), settings.rollback);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let connected = channel.watch_connected();
        let (snapshots, snapshot_rx) = watch::channel(engine.snapshot(*connected.borrow()));
        let (notices, _) = broadcast::channel(64);

        let subscriptions = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let inbox = inbox.clone();
                let room = project_id.clone();
                channel.on(kind, move |event| {
                    if event.project_id == room {
                        let _ = inbox.send(Input::Remote(event.clone()));
                    }
                })
            })
            .collect();
        channel.subscribe(&project_id);
        info!(project_id = %project_id, "board opened");

        let known_connections = channel.connections();
        let board = BoardLoop {
            engine,
            api,
            channel,
            subscriptions,
            inbox,
            snapshots,
            notices: notices.clone(),
            connected,
            refetch_on_reconnect: settings.refetch_on_reconnect,
            known_connections,
            last_request: 0,
            published_revision: None,
        };
        let task = tokio::spawn(board.run(commands_rx, inbox_rx));

        BoardHandle {
            project_id,
            commands,
            snapshots: snapshot_rx,
            notices,
            task: Some(task),
        }
    }
}

pub struct BoardHandle {
    project_id: ProjectId,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<BoardSnapshot>,
    notices: broadcast::Sender<BoardNotice>,
    task: Option<JoinHandle<()>>,
}

impl BoardHandle {
    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<BoardSnapshot> {
        self.snapshots.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<BoardNotice> {
        self.notices.subscribe()
    }

    pub fn drag(&self, gesture: DragGesture) -> Result<(), BoardError> {
        self.send(Command::Drag(gesture))
    }

    /// Validates the title before anything is shown or sent.
    pub fn create(&self, mut fields: NewTask) -> Result<(), BoardError> {
        fields.title = self.checked_title(&fields.title)?;
        self.send(Command::Create(fields))
    }

    pub fn edit(&self, task_id: TaskId, mut patch: TaskPatch) -> Result<(), BoardError> {
        if let Some(title) = &patch.title {
            patch.title = Some(self.checked_title(title)?);
        }
        self.send(Command::Edit(task_id, patch))
    }

    pub fn delete(&self, task_id: TaskId) -> Result<(), BoardError> {
        self.send(Command::Delete(task_id))
    }

    pub fn refetch(&self) -> Result<(), BoardError> {
        self.send(Command::Refetch)
    }

    /// Leaves the room and stops the board task. Completions still in flight
    /// are discarded.
    pub async fn close(mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn checked_title(&self, raw: &str) -> Result<String, BoardError> {
        validate_title(raw).map_err(|err| {
            let _ = self.notices.send(BoardNotice::Failure(err.to_string()));
            BoardError::InvalidTitle(err)
        })
    }

    fn send(&self, command: Command) -> Result<(), BoardError> {
        self.commands.send(command).map_err(|_| BoardError::Closed)
    }
}

struct BoardLoop {
    engine: ReconciliationEngine,
    api: Arc<dyn TaskApi>,
    channel: Arc<Channel>,
    subscriptions: Vec<Subscription>,
    inbox: mpsc::UnboundedSender<Input>,
    snapshots: watch::Sender<BoardSnapshot>,
    notices: broadcast::Sender<BoardNotice>,
    connected: watch::Receiver<bool>,
    refetch_on_reconnect: bool,
    known_connections: u64,
    last_request: u64,
    published_revision: Option<(u64, bool)>,
}

impl BoardLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: mpsc::UnboundedReceiver<Input>,
    ) {
        self.refetch();
        let mut watching = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(input) = inbox.recv() => self.handle_input(input),
                changed = self.connected.changed(), if watching => match changed {
                    Ok(()) => self.handle_connection(),
                    Err(_) => watching = false,
                },
            }
            self.publish();
        }

        self.channel.unsubscribe(self.engine.project_id());
        self.subscriptions.clear();
        info!(project_id = %self.engine.project_id(), "board closed");
    }

    fn handle_command(&mut self, command: Command) {
        let pending = match command {
            Command::Drag(gesture) => drag::drive(&mut self.engine, &gesture),
            Command::Create(fields) => Some(self.engine.begin_create(fields)),
            Command::Edit(task_id, patch) => {
                let pending = self.engine.begin_edit(&task_id, patch);
                if pending.is_none() {
                    self.notify(BoardNotice::Failure("Task is not available".into()));
                }
                pending
            }
            Command::Delete(task_id) => {
                let pending = self.engine.begin_delete(&task_id);
                if pending.is_none() {
                    self.notify(BoardNotice::Failure("Task is not available".into()));
                }
                pending
            }
            Command::Refetch => {
                self.refetch();
                None
            }
            Command::Close => None,
        };
        if let Some(pending) = pending {
            self.dispatch(pending);
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Remote(event) => {
                let outcome = self.engine.apply_remote(&event);
                debug!(
                    kind = %event.event.kind(),
                    task_id = %event.event.task_id(),
                    ?outcome,
                    "remote event"
                );
            }
            Input::Settled { ticket, result } => self.settle(ticket, result),
            Input::Loaded { request, result } => {
                if request != self.last_request {
                    debug!(request, latest = self.last_request, "dropping superseded listing");
                    return;
                }
                match result {
                    Ok(tasks) => {
                        debug!(count = tasks.len(), "board listing loaded");
                        self.engine.replace_all(tasks);
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to load board");
                        self.notify(BoardNotice::Failure(format!("Failed to load tasks: {err}")));
                    }
                }
            }
        }
    }

    /// Events missed while offline are never replayed, so a reconnect
    /// re-lists the board. The first connection is not a reconnect.
    fn handle_connection(&mut self) {
        if !*self.connected.borrow_and_update() {
            return;
        }
        let connections = self.channel.connections();
        let reconnected = self.known_connections > 0 && connections > self.known_connections;
        self.known_connections = connections;
        if reconnected && self.refetch_on_reconnect {
            info!("push channel back; refetching board");
            self.refetch();
        }
    }

    fn settle(&mut self, ticket: Ticket, result: Result<Confirmation, ApiFailure>) {
        let settlement = match result {
            Ok(confirmation) => self.engine.confirm(ticket, confirmation),
            Err(err) => {
                warn!(error = %err, "task mutation rejected");
                let settlement = self.engine.reject(ticket);
                if let Settlement::RolledBack { kind, .. } = settlement {
                    self.notify(BoardNotice::Failure(format!(
                        "{}: {err}",
                        kind.failure_message()
                    )));
                }
                settlement
            }
        };
        match settlement {
            Settlement::Confirmed(kind) => {
                self.notify(BoardNotice::Success(kind.success_message().into()));
            }
            Settlement::RolledBack { refetch: true, .. } => self.refetch(),
            Settlement::RolledBack { .. } => {}
            Settlement::Stale => debug!("ignoring settled call for another board"),
        }
    }

    fn dispatch(&self, pending: PendingCall) {
        let PendingCall { ticket, kind, call } = pending;
        debug!(?kind, "sending task mutation");
        let api = Arc::clone(&self.api);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = match call {
                RestCall::Create { project_id, fields } => api
                    .create_task(&project_id, &fields)
                    .await
                    .map(Confirmation::Task),
                RestCall::Update { task_id, patch } => api
                    .update_task(&task_id, &patch)
                    .await
                    .map(Confirmation::Task),
                RestCall::Delete { task_id } => api
                    .delete_task(&task_id)
                    .await
                    .map(|()| Confirmation::Deleted),
            };
            let _ = inbox.send(Input::Settled { ticket, result });
        });
    }

    /// Only the most recent listing is applied.
    fn refetch(&mut self) {
        self.last_request += 1;
        let request = self.last_request;
        let project_id = self.engine.project_id().clone();
        let api = Arc::clone(&self.api);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = api.list_tasks(&project_id).await;
            let _ = inbox.send(Input::Loaded { request, result });
        });
    }

    fn notify(&self, notice: BoardNotice) {
        let _ = self.notices.send(notice);
    }

    fn publish(&mut self) {
        let connected = *self.connected.borrow();
        let current = (self.engine.store().revision(), connected);
        if self.published_revision == Some(current) {
            return;
        }
        self.published_revision = Some(current);
        self.snapshots.send_replace(self.engine.snapshot(connected));
    }
}

#[cfg(test)]
#[path = "tests/board_tests.rs"]
mod tests;
