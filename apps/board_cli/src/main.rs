mod commands;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use client_core::{
    load_settings, BoardHandle, BoardNotice, BoardSnapshot, BoardView, ChannelProvider,
    DragGesture, DropLocation, HttpApi, ReconnectPolicy, SessionSignal, TaskApi, WsTransport,
};
use shared::{
    domain::{NewTask, ProjectId, TaskPatch, TaskStatus},
    triage::{self, Priority, SortKey},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::{CliCommand, HELP};

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `api_url` from planner.toml / PLANNER__API_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    project: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.api_url = server_url;
    }

    let api = HttpApi::from_settings(&settings)?;
    let session = api
        .login(&args.email, &args.password)
        .await
        .context("login failed")?;
    println!("Logged in as {} <{}>", session.user.name, session.user.email);

    let transport = WsTransport::from_settings(&settings)?;
    let provider = ChannelProvider::new(
        Arc::new(transport),
        ReconnectPolicy::from_settings(&settings),
    );
    let channel = provider.connect(&session.token);
    let task_api: Arc<dyn TaskApi> = api.clone();
    let board = BoardView::open(ProjectId::new(args.project), task_api, channel, &settings);

    spawn_printer(&board);
    println!("{HELP}");

    let mut signals = api.session_signals();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match commands::parse(&line) {
                    Ok(CliCommand::Quit) => break,
                    Ok(command) => {
                        if let Err(err) = run_command(&board, command) {
                            println!("! {err}");
                        }
                    }
                    Err(err) => println!("! {err}"),
                }
            }
            signal = signals.recv() => {
                if let Ok(SessionSignal::Expired) = signal {
                    warn!("session expired; log in again");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    board.close().await;
    provider.disconnect();
    api.logout();
    info!("bye");
    Ok(())
}

fn run_command(board: &BoardHandle, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Show(key) => print_board(&board.snapshot(), key),
        CliCommand::Move { task_id, to } => {
            let snapshot = board.snapshot();
            let from = snapshot
                .status_of(&task_id)
                .with_context(|| format!("no task {task_id} on this board"))?;
            let index = snapshot
                .column(from)
                .iter()
                .position(|id| id == &task_id)
                .unwrap_or_default();
            board.drag(DragGesture {
                task_id,
                source: DropLocation::new(from, index),
                destination: Some(DropLocation::new(to, snapshot.column(to).len())),
            })?;
        }
        CliCommand::Add { status, title } => board.create(NewTask::titled(title, status))?,
        CliCommand::Rename { task_id, title } => board.edit(
            task_id,
            TaskPatch {
                title: Some(title),
                ..TaskPatch::default()
            },
        )?,
        CliCommand::Remove(task_id) => board.delete(task_id)?,
        CliCommand::Refetch => board.refetch()?,
        CliCommand::Help => println!("{HELP}"),
        CliCommand::Quit => {}
    }
    Ok(())
}

fn spawn_printer(board: &BoardHandle) {
    let mut snapshots = board.watch();
    let mut notices = board.notices();
    tokio::spawn(async move {
        let mut last_connected = None;
        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    if last_connected != Some(snapshot.connected) {
                        last_connected = Some(snapshot.connected);
                        println!("-- {} --", if snapshot.connected { "live" } else { "offline" });
                    }
                    print_board(&snapshot, SortKey::default());
                }
                notice = notices.recv() => match notice {
                    Ok(BoardNotice::Success(message)) => println!("ok: {message}"),
                    Ok(BoardNotice::Failure(message)) => println!("error: {message}"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => break,
                },
            }
        }
    });
}

fn print_board(snapshot: &BoardSnapshot, key: SortKey) {
    let now = Utc::now();
    let all: Vec<_> = snapshot.tasks.values().cloned().collect();
    println!(
        "== {} ({} tasks, {}% done) ==",
        snapshot.project_id,
        all.len(),
        triage::progress(&all)
    );
    for status in TaskStatus::ALL {
        let column: Vec<_> = snapshot.column_tasks(status).into_iter().cloned().collect();
        println!("{} [{}]", status.label(), column.len());
        let ordered = if key == SortKey::CreatedAt {
            column
        } else {
            triage::sort_tasks(&column, key, now)
        };
        for task in &ordered {
            let marker = match triage::priority(task, now) {
                Priority::Overdue => " OVERDUE",
                Priority::Urgent => " urgent",
                Priority::High => " soon",
                Priority::Normal => "",
            };
            let pending = if task.id.is_provisional() { " (saving)" } else { "" };
            println!("  {:<26} {}{marker}{pending}", task.id.as_str(), task.title);
        }
    }
}
