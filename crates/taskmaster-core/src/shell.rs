use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::view::UserAction;

pub const HELP: &str = "\
commands:
  add <text>     add a task (bare text works too)
  t <n>          toggle task n
  d <n>          delete task n
  theme          switch between light and dark
  logout         sign out and leave
  help           show this help
  quit           leave";

/// Parses one input line. Blank lines yield `Ok(None)`; bare text is added
/// exactly as typed.
pub fn parse_action(line: &str) -> Result<Option<UserAction>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };

    let action = match head.to_ascii_lowercase().as_str() {
        "add" | "a" => UserAction::Add(rest.to_string()),
        "toggle" | "t" | "done" => UserAction::Toggle(parse_position(rest)?),
        "delete" | "d" | "rm" => UserAction::Delete(parse_position(rest)?),
        "theme" => UserAction::ToggleTheme,
        "logout" => UserAction::SignOut,
        "help" | "?" => UserAction::Help,
        "quit" | "q" | "exit" => UserAction::Quit,
        _ => UserAction::Add(line.to_string()),
    };
    Ok(Some(action))
}

fn parse_position(raw: &str) -> Result<usize, String> {
    raw.parse::<usize>()
        .ok()
        .filter(|position| *position > 0)
        .ok_or_else(|| format!("expected a task number, got {raw:?}"))
}

/// Feeds parsed stdin lines into `actions` until stdin closes or the
/// receiver goes away.
pub async fn read_actions(actions: mpsc::UnboundedSender<UserAction>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_action(&line) {
                Ok(Some(action)) => {
                    if actions.send(action).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(message) => {
                    if actions.send(UserAction::Unrecognized(message)).is_err() {
                        break;
                    }
                }
            },
            Ok(None) => {
                debug!("stdin closed");
                let _ = actions.send(UserAction::Quit);
                break;
            }
            Err(err) => {
                warn!(error = %err, "failed reading stdin");
                let _ = actions.send(UserAction::Quit);
                break;
            }
        }
    }
}
