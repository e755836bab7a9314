use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{channel::mpsc as fmpsc, SinkExt, StreamExt};
use shared::{
    domain::{TaskStatus, TitleError},
    error::ErrorCode,
};
use tokio::{sync::Notify, time::timeout};

use super::*;
use crate::{
    channel::{ChannelConnection, ChannelTransport, ReconnectPolicy},
    config::RollbackPolicy,
    drag::DropLocation,
    error::ChannelError,
};

const WAIT: Duration = Duration::from_secs(2);

fn task(id: &str, status: TaskStatus) -> Task {
    Task {
        id: TaskId::from(id),
        project_id: Some(ProjectId::from("p1")),
        title: format!("task {id}"),
        description: String::new(),
        status,
        assigned_to: None,
        due_date: None,
        created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    }
}

#[derive(Default)]
struct FakeApi {
    tasks: Mutex<Vec<Task>>,
    calls: Mutex<Vec<String>>,
    fail_mutations: AtomicBool,
    gated: AtomicBool,
    gate: Notify,
    created: AtomicUsize,
}

impl FakeApi {
    fn with_tasks(tasks: Vec<Task>) -> Arc<Self> {
        let api = Self::default();
        *api.tasks.lock().unwrap() = tasks;
        Arc::new(api)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    async fn mutation(&self, call: String) -> Result<(), ApiFailure> {
        self.calls.lock().unwrap().push(call);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(ApiFailure::Status {
                status: 500,
                code: ErrorCode::Internal,
                message: "database unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TaskApi for FakeApi {
    async fn list_tasks(&self, _project_id: &ProjectId) -> Result<Vec<Task>, ApiFailure> {
        self.calls.lock().unwrap().push("list".into());
        Ok(self.tasks.lock().unwrap().clone())
    }

    async fn create_task(
        &self,
        _project_id: &ProjectId,
        fields: &NewTask,
    ) -> Result<Task, ApiFailure> {
        self.mutation(format!("create {}", fields.title)).await?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let mut created = task(&format!("srv-{n}"), fields.status);
        created.title = fields.title.clone();
        self.tasks.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn update_task(&self, task_id: &TaskId, patch: &TaskPatch) -> Result<Task, ApiFailure> {
        self.mutation(format!("update {task_id}")).await?;
        let mut tasks = self.tasks.lock().unwrap();
        let stored = tasks
            .iter_mut()
            .find(|task| &task.id == task_id)
            .ok_or(ApiFailure::Status {
                status: 404,
                code: ErrorCode::NotFound,
                message: "Task not found".into(),
            })?;
        *stored = patch.apply_to(stored);
        Ok(stored.clone())
    }

    async fn delete_task(&self, task_id: &TaskId) -> Result<(), ApiFailure> {
        self.mutation(format!("delete {task_id}")).await?;
        self.tasks.lock().unwrap().retain(|task| &task.id != task_id);
        Ok(())
    }
}

struct ServerEnd {
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: fmpsc::UnboundedSender<anyhow::Result<String>>,
}

impl ServerEnd {
    async fn next_frame(&mut self) -> serde_json::Value {
        let text = timeout(WAIT, self.from_client.next())
            .await
            .expect("client frame in time")
            .expect("client still connected");
        serde_json::from_str(&text).expect("client frames are json")
    }

    fn push(&self, event: RoomEvent) {
        self.to_client
            .unbounded_send(Ok(event.to_frame().to_string()))
            .expect("client still listening");
    }
}

struct FakeTransport {
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait]
impl ChannelTransport for FakeTransport {
    async fn connect(&self, _token: &str) -> Result<ChannelConnection, ChannelError> {
        let (client_tx, from_client) = fmpsc::unbounded::<String>();
        let (to_client, client_rx) = fmpsc::unbounded::<anyhow::Result<String>>();
        let _ = self.accepted.send(ServerEnd {
            from_client,
            to_client,
        });
        Ok(ChannelConnection {
            outbound: Box::pin(client_tx.sink_map_err(anyhow::Error::from)),
            inbound: client_rx.boxed(),
        })
    }
}

struct Harness {
    api: Arc<FakeApi>,
    channel: Arc<Channel>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
    board: BoardHandle,
}

impl Harness {
    async fn open(tasks: Vec<Task>, settings: Settings) -> (Self, ServerEnd) {
        let api = FakeApi::with_tasks(tasks);
        let (accepted, mut servers) = mpsc::unbounded_channel();
        let channel = Channel::spawn(
            Arc::new(FakeTransport { accepted }),
            "tok",
            ReconnectPolicy {
                attempts: 3,
                delay: Duration::from_millis(10),
            },
        );
        let board = BoardView::open(
            ProjectId::from("p1"),
            api.clone(),
            Arc::clone(&channel),
            &settings,
        );
        let mut server = timeout(WAIT, servers.recv())
            .await
            .expect("connect in time")
            .expect("transport alive");
        assert_eq!(server.next_frame().await["type"], "join_project");

        let harness = Self {
            api,
            channel,
            servers,
            board,
        };
        harness.wait_for(|snap| snap.connected && snap.revision > 0).await;
        (harness, server)
    }

    async fn wait_for(&self, predicate: impl Fn(&BoardSnapshot) -> bool) -> BoardSnapshot {
        let mut snapshots = self.board.watch();
        let snapshot = timeout(WAIT, snapshots.wait_for(|snap| predicate(snap)))
            .await
            .expect("board state in time")
            .expect("board alive")
            .clone();
        snapshot
    }

    async fn wait_calls(&self, prefix: &str, count: usize) {
        timeout(WAIT, async {
            while self.api.count(prefix) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("api calls in time");
    }
}

async fn next_notice(notices: &mut broadcast::Receiver<BoardNotice>) -> BoardNotice {
    timeout(WAIT, notices.recv())
        .await
        .expect("notice in time")
        .expect("notices open")
}

fn drop_gesture(id: &str, from: TaskStatus, to: Option<TaskStatus>) -> DragGesture {
    DragGesture {
        task_id: TaskId::from(id),
        source: DropLocation::new(from, 0),
        destination: to.map(|status| DropLocation::new(status, 0)),
    }
}

#[tokio::test]
async fn initial_load_fills_columns() {
    let (harness, _server) = Harness::open(
        vec![task("t1", TaskStatus::Todo), task("t2", TaskStatus::Completed)],
        Settings::default(),
    )
    .await;

    let snap = harness.board.snapshot();
    assert_eq!(snap.column(TaskStatus::Todo), &[TaskId::from("t1")]);
    assert_eq!(snap.column(TaskStatus::Completed), &[TaskId::from("t2")]);
    assert!(snap.column(TaskStatus::InProgress).is_empty());
    assert_eq!(harness.api.calls(), vec!["list".to_string()]);
}

#[tokio::test]
async fn drag_moves_card_before_server_answers() {
    let (harness, _server) =
        Harness::open(vec![task("t1", TaskStatus::Todo)], Settings::default()).await;
    let mut notices = harness.board.notices();
    harness.api.gated.store(true, Ordering::SeqCst);

    harness
        .board
        .drag(drop_gesture("t1", TaskStatus::Todo, Some(TaskStatus::InProgress)))
        .unwrap();

    let snap = harness
        .wait_for(|snap| snap.status_of(&TaskId::from("t1")) == Some(TaskStatus::InProgress))
        .await;
    assert!(snap.column(TaskStatus::Todo).is_empty());
    harness.wait_calls("update", 1).await;

    harness.api.gate.notify_one();
    assert_eq!(
        next_notice(&mut notices).await,
        BoardNotice::Success("Task moved successfully".into())
    );
    assert_eq!(harness.api.count("update t1"), 1);
    assert_eq!(
        harness.board.snapshot().status_of(&TaskId::from("t1")),
        Some(TaskStatus::InProgress)
    );
}

#[tokio::test]
async fn failed_drag_snaps_back() {
    let (harness, _server) =
        Harness::open(vec![task("t1", TaskStatus::Todo)], Settings::default()).await;
    let mut notices = harness.board.notices();
    harness.api.fail_mutations.store(true, Ordering::SeqCst);

    harness
        .board
        .drag(drop_gesture("t1", TaskStatus::Todo, Some(TaskStatus::Completed)))
        .unwrap();

    let BoardNotice::Failure(message) = next_notice(&mut notices).await else {
        panic!("expected a failure notice");
    };
    assert!(message.starts_with("Failed to move task"), "{message}");
    let snap = harness
        .wait_for(|snap| snap.status_of(&TaskId::from("t1")) == Some(TaskStatus::Todo))
        .await;
    assert!(snap.column(TaskStatus::Completed).is_empty());
}

#[tokio::test]
async fn refetch_policy_relists_after_failure() {
    let settings = Settings {
        rollback: RollbackPolicy::Refetch,
        ..Settings::default()
    };
    let (harness, _server) = Harness::open(vec![task("t1", TaskStatus::Todo)], settings).await;
    harness.api.fail_mutations.store(true, Ordering::SeqCst);

    harness
        .board
        .drag(drop_gesture("t1", TaskStatus::Todo, Some(TaskStatus::Completed)))
        .unwrap();

    harness.wait_calls("list", 2).await;
    harness
        .wait_for(|snap| snap.status_of(&TaskId::from("t1")) == Some(TaskStatus::Todo))
        .await;
}

#[tokio::test]
async fn cancelled_drag_sends_nothing() {
    let (harness, _server) =
        Harness::open(vec![task("t1", TaskStatus::Todo)], Settings::default()).await;
    let mut notices = harness.board.notices();

    harness
        .board
        .drag(drop_gesture("t1", TaskStatus::Todo, None))
        .unwrap();
    harness
        .board
        .create(NewTask::titled("Marker task", TaskStatus::Todo))
        .unwrap();
    next_notice(&mut notices).await;

    assert_eq!(harness.api.count("update"), 0);
    assert_eq!(
        harness.board.snapshot().status_of(&TaskId::from("t1")),
        Some(TaskStatus::Todo)
    );
}

#[tokio::test]
async fn invalid_title_is_rejected_before_any_mutation() {
    let (harness, _server) = Harness::open(vec![], Settings::default()).await;
    let revision = harness.board.snapshot().revision;
    let mut notices = harness.board.notices();

    let err = harness
        .board
        .create(NewTask::titled("  ab ", TaskStatus::Todo))
        .unwrap_err();
    assert!(matches!(err, BoardError::InvalidTitle(TitleError::TooShort)));
    assert_eq!(
        next_notice(&mut notices).await,
        BoardNotice::Failure("title must be at least 3 characters".into())
    );

    let long = "x".repeat(101);
    let err = harness
        .board
        .edit(
            TaskId::from("t1"),
            TaskPatch {
                title: Some(long),
                ..TaskPatch::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, BoardError::InvalidTitle(TitleError::TooLong)));

    assert_eq!(harness.board.snapshot().revision, revision);
    assert_eq!(harness.api.count("create"), 0);
}

#[tokio::test]
async fn create_shows_provisional_card_then_canonical() {
    let (harness, _server) = Harness::open(vec![], Settings::default()).await;
    harness.api.gated.store(true, Ordering::SeqCst);

    harness
        .board
        .create(NewTask::titled("  Plan sprint  ", TaskStatus::InProgress))
        .unwrap();

    let snap = harness
        .wait_for(|snap| snap.column(TaskStatus::InProgress).len() == 1)
        .await;
    let provisional = &snap.column(TaskStatus::InProgress)[0];
    assert!(provisional.is_provisional());
    assert_eq!(snap.task(provisional).unwrap().title, "Plan sprint");

    harness.api.gate.notify_one();
    let snap = harness
        .wait_for(|snap| snap.task(&TaskId::from("srv-1")).is_some())
        .await;
    assert_eq!(snap.tasks.len(), 1);
}

#[tokio::test]
async fn remote_events_reach_the_board() {
    let (harness, server) =
        Harness::open(vec![task("t1", TaskStatus::Todo)], Settings::default()).await;

    server.push(RoomEvent {
        project_id: ProjectId::from("p1"),
        event: shared::protocol::BoardEvent::Created(task("t2", TaskStatus::Completed)),
    });
    server.push(RoomEvent {
        project_id: ProjectId::from("p1"),
        event: shared::protocol::BoardEvent::Deleted {
            task_id: TaskId::from("t1"),
        },
    });

    let snap = harness
        .wait_for(|snap| snap.tasks.len() == 1 && snap.task(&TaskId::from("t2")).is_some())
        .await;
    assert_eq!(snap.column(TaskStatus::Completed), &[TaskId::from("t2")]);
}

#[tokio::test]
async fn reconnect_refetches_and_mirrors_connection() {
    let (mut harness, server) =
        Harness::open(vec![task("t1", TaskStatus::Todo)], Settings::default()).await;
    harness
        .api
        .tasks
        .lock()
        .unwrap()
        .push(task("missed", TaskStatus::Todo));

    drop(server);
    let mut again = timeout(WAIT, harness.servers.recv())
        .await
        .expect("reconnect in time")
        .expect("transport alive");
    assert_eq!(again.next_frame().await["type"], "join_project");

    harness.wait_calls("list", 2).await;
    let snap = harness
        .wait_for(|snap| snap.connected && snap.task(&TaskId::from("missed")).is_some())
        .await;
    assert_eq!(snap.column(TaskStatus::Todo).len(), 2);
}

#[tokio::test]
async fn close_leaves_room_and_detaches_handlers() {
    let (harness, mut server) = Harness::open(vec![], Settings::default()).await;
    assert_eq!(harness.channel.handler_count(), EventKind::ALL.len());

    let Harness { board, channel, .. } = harness;
    board.close().await;

    assert_eq!(
        server.next_frame().await,
        serde_json::json!({"type": "leave_project", "payload": {"project_id": "p1"}})
    );
    assert_eq!(channel.handler_count(), 0);
    assert!(channel.rooms().is_empty());
}
