//! Timed action lists.
//!
//! An [`Event`] is not a network node. Once started it waits `delay`
//! seconds, runs its actions in order, reports `event-accomplished` and
//! waits again until it is stopped. Scheduling lives in the factory; this
//! module holds the data model and its textual forms.

use crate::config::{Config, Parameter};
use crate::error::{CoreError, Result};
use std::fmt::Write as _;
use std::process::{Command, Stdio};
use tokio::task::JoinHandle;

/// One step of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Command replayed through the console interpreter.
    VbShell(String),
    /// Command run by the host shell.
    HostShell(String),
}

impl Action {
    /// Prefixed form stored in project files (`add ...` / `addsh ...`).
    pub fn to_line(&self) -> String {
        match self {
            Action::VbShell(cmd) => format!("add {cmd}"),
            Action::HostShell(cmd) => format!("addsh {cmd}"),
        }
    }

    /// Parse a prefixed action line.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(cmd) = line.strip_prefix("addsh ") {
            Some(Action::HostShell(cmd.trim().to_string()))
        } else {
            line.strip_prefix("add ")
                .map(|cmd| Action::VbShell(cmd.trim().to_string()))
        }
    }
}

/// A named, schedulable list of actions.
#[derive(Debug)]
pub struct Event {
    pub name: String,
    pub config: Config,
    pub actions: Vec<Action>,
    /// Armed timer task while the event runs.
    pub timer: Option<JoinHandle<()>>,
}

impl Event {
    pub const TYPE_NAME: &'static str = "Event";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::new(&[("delay", Parameter::Integer(0))]),
            actions: Vec::new(),
            timer: None,
        }
    }

    pub fn delay(&self) -> i64 {
        self.config.int("delay")
    }

    /// An event can start once it has actions and a positive delay.
    pub fn configured(&self) -> bool {
        !self.actions.is_empty() && self.delay() > 0
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Apply the words following `config` on the console.
    ///
    /// `add <cmd>` appends a console action, `addsh <cmd>` a host shell
    /// action; anything else is a list of `key=value` assignments. Both
    /// action kinds cannot be given in one command.
    pub fn configure(&mut self, words: &[String]) -> Result<()> {
        let Some(first) = words.first() else {
            return Err(CoreError::invalid_value(&self.name, "nothing to configure"));
        };
        match first.as_str() {
            "add" | "addsh" => {
                let rest = &words[1..];
                if rest.iter().any(|w| w == "add" || w == "addsh") {
                    return Err(CoreError::invalid_value(
                        &self.name,
                        "add and addsh cannot be mixed in one command",
                    ));
                }
                if rest.is_empty() {
                    return Err(CoreError::invalid_value(&self.name, "empty action"));
                }
                // Words arrive unquoted; quote them again so each stays one argument.
                let cmd = rest
                    .iter()
                    .map(|w| crate::console::quote(w))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.actions.push(if first == "add" {
                    Action::VbShell(cmd)
                } else {
                    Action::HostShell(cmd)
                });
                Ok(())
            }
            _ => {
                for word in words {
                    if let Some(encoded) = word.strip_prefix("actions=") {
                        self.actions = parse_actions(encoded)?;
                    } else {
                        self.config.set(word)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Append the `[Event:<name>]` section.
    pub fn save_to(&self, out: &mut String) {
        self.config.save_to(out, Self::TYPE_NAME, &self.name);
        let _ = writeln!(out, "actions={}", encode_actions(&self.actions));
        out.push('\n');
    }

    /// Human summary for `list`/`show`.
    pub fn summary(&self) -> String {
        format!(
            "Delay: {}s, Actions: {}",
            self.delay(),
            self.actions
                .iter()
                .map(Action::to_line)
                .collect::<Vec<_>>()
                .join("; ")
        )
    }
}

/// Encode actions as a bracketed list of single-quoted strings.
pub fn encode_actions(actions: &[Action]) -> String {
    let items: Vec<String> = actions
        .iter()
        .map(|a| {
            let line = a.to_line().replace('\\', "\\\\").replace('\'', "\\'");
            format!("'{line}'")
        })
        .collect();
    format!("[{}]", items.join(", "))
}

/// Parse the bracketed list written by [`encode_actions`].
///
/// Double-quoted items are accepted as well.
pub fn parse_actions(text: &str) -> Result<Vec<Action>> {
    let bad = |reason: &str| CoreError::invalid_value("actions", reason.to_string());
    let body = text
        .trim()
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| bad("expected a bracketed list"))?;

    let mut actions = Vec::new();
    let mut chars = body.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(quote) = chars.next() else {
            break;
        };
        if quote != '\'' && quote != '"' {
            return Err(bad("expected a quoted string"));
        }
        let mut item = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => item.extend(chars.next()),
                c if c == quote => {
                    closed = true;
                    break;
                }
                c => item.push(c),
            }
        }
        if !closed {
            return Err(bad("unterminated string"));
        }
        let action = Action::from_line(&item).ok_or_else(|| bad("unknown action kind"))?;
        actions.push(action);
    }
    Ok(actions)
}

/// Start a host shell action without waiting for it.
pub fn spawn_host_action(event: &str, cmd: &str) {
    match Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(mut child) => {
            let event = event.to_string();
            let cmd = cmd.to_string();
            std::thread::spawn(move || match child.wait() {
                Ok(status) => tracing::debug!(event = %event, cmd = %cmd, %status, "Host action finished"),
                Err(e) => tracing::warn!(event = %event, error = %e, "Host action lost"),
            });
        }
        Err(e) => tracing::warn!(event, cmd, error = %e, "Host action failed to start"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_configure_actions() {
        let mut event = Event::new("ev1");
        assert!(!event.configured());

        event.configure(&words("add sw1 on")).unwrap();
        event.configure(&words("addsh echo hi")).unwrap();
        assert!(!event.configured());
        event.configure(&words("delay=5")).unwrap();
        assert!(event.configured());
        assert_eq!(
            event.actions,
            vec![
                Action::VbShell("sw1 on".into()),
                Action::HostShell("echo hi".into())
            ]
        );

        assert!(event.configure(&words("add sw1 on addsh ls")).is_err());

        event.actions.clear();
        let quoted = vec!["addsh".to_string(), "echo".to_string(), "a   b".to_string()];
        event.configure(&quoted).unwrap();
        assert_eq!(event.actions, vec![Action::HostShell("echo \"a   b\"".into())]);
        assert!(event.configure(&words("add")).is_err());
    }

    #[test]
    fn test_actions_encoding() {
        let actions = vec![
            Action::HostShell("echo 'quoted' \\ back".into()),
            Action::VbShell("sw1 config numports=8".into()),
        ];
        let encoded = encode_actions(&actions);
        assert!(encoded.starts_with("['addsh echo \\'quoted\\'"));
        assert_eq!(parse_actions(&encoded).unwrap(), actions);
        assert_eq!(parse_actions("[]").unwrap(), vec![]);
        assert_eq!(
            parse_actions("[\"add sw1 off\"]").unwrap(),
            vec![Action::VbShell("sw1 off".into())]
        );
        assert!(parse_actions("['add sw1").is_err());
        assert!(parse_actions("['rm -rf']").is_err());
    }

    #[test]
    fn test_save_section() {
        let mut event = Event::new("ev1");
        event.configure(&words("delay=3")).unwrap();
        event.configure(&words("add sw1 on")).unwrap();
        let mut out = String::new();
        event.save_to(&mut out);
        assert_eq!(out, "[Event:ev1]\ndelay=3\nactions=['add sw1 on']\n\n");
    }
}
