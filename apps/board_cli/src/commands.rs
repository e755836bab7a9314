use shared::{
    domain::{TaskId, TaskStatus},
    triage::SortKey,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Show(SortKey),
    Move { task_id: TaskId, to: TaskStatus },
    Add { status: TaskStatus, title: String },
    Rename { task_id: TaskId, title: String },
    Remove(TaskId),
    Refetch,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  show [created|due|title|status|priority]
  mv <task-id> <todo|inprogress|completed>
  add <status> <title...>
  rename <task-id> <title...>
  rm <task-id>
  refetch
  quit";

fn sort_key(raw: &str) -> Result<SortKey, String> {
    match raw {
        "created" => Ok(SortKey::CreatedAt),
        "due" => Ok(SortKey::DueDate),
        "title" => Ok(SortKey::Title),
        "status" => Ok(SortKey::Status),
        "priority" => Ok(SortKey::Priority),
        other => Err(format!("unknown sort key: {other}")),
    }
}

fn status(raw: Option<&str>) -> Result<TaskStatus, String> {
    raw.ok_or_else(|| "missing status".to_string())?
        .parse()
        .map_err(|err: shared::domain::UnknownStatus| err.to_string())
}

fn task_id(raw: Option<&str>) -> Result<TaskId, String> {
    raw.map(TaskId::from)
        .ok_or_else(|| "missing task id".to_string())
}

fn rest(words: &[&str]) -> String {
    words.join(" ")
}

pub fn parse(line: &str) -> Result<CliCommand, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, args)) = words.split_first() else {
        return Ok(CliCommand::Show(SortKey::default()));
    };
    match head {
        "show" | "ls" => match args.first() {
            Some(raw) => sort_key(raw).map(CliCommand::Show),
            None => Ok(CliCommand::Show(SortKey::default())),
        },
        "mv" | "move" => Ok(CliCommand::Move {
            task_id: task_id(args.first().copied())?,
            to: status(args.get(1).copied())?,
        }),
        "add" => Ok(CliCommand::Add {
            status: status(args.first().copied())?,
            title: rest(args.get(1..).unwrap_or_default()),
        }),
        "rename" => Ok(CliCommand::Rename {
            task_id: task_id(args.first().copied())?,
            title: rest(args.get(1..).unwrap_or_default()),
        }),
        "rm" | "delete" => Ok(CliCommand::Remove(task_id(args.first().copied())?)),
        "refetch" => Ok(CliCommand::Refetch),
        "help" | "?" => Ok(CliCommand::Help),
        "quit" | "exit" | "q" => Ok(CliCommand::Quit),
        other => Err(format!("unknown command: {other} (try `help`)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_move_with_status_alias() {
        assert_eq!(
            parse("mv t1 done"),
            Ok(CliCommand::Move {
                task_id: TaskId::from("t1"),
                to: TaskStatus::Completed,
            })
        );
    }

    #[test]
    fn add_keeps_multi_word_title() {
        assert_eq!(
            parse("add inprogress Write the launch post"),
            Ok(CliCommand::Add {
                status: TaskStatus::InProgress,
                title: "Write the launch post".into(),
            })
        );
    }

    #[test]
    fn blank_line_shows_board() {
        assert_eq!(parse("   "), Ok(CliCommand::Show(SortKey::CreatedAt)));
        assert_eq!(parse("show priority"), Ok(CliCommand::Show(SortKey::Priority)));
    }

    #[test]
    fn reports_bad_input() {
        assert!(parse("mv t1").is_err());
        assert!(parse("mv t1 blocked").is_err());
        assert!(parse("rm").is_err());
        assert!(parse("frobnicate").is_err());
    }
}
