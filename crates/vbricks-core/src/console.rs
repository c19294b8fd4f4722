//! Text command interpreter.
//!
//! One grammar serves the local stdin console, the remote-control protocol
//! and event actions:
//!
//! ```text
//! new <type> <name> [<homehost>]
//! <name> on|off|remove|show|disconnect|help|dup
//! <name> connect <sock>
//! <name> config <key>=<value> ...     (events: config add|addsh <cmd>)
//! <name> rename <new>
//! list|ls  socks  connections  ps
//! images [list | add <name> <path> [host] | del <name> | readonly <name> on|off]
//! control <host> <password>
//! reset all
//! q|quit  h|help
//! ```

use crate::error::{CoreError, Result};
use crate::factory::Factory;
use crate::link::PlugMode;
use std::io::Write;

/// Result of interpreting one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Fail,
    Quit,
    /// The caller should connect to a remote host, now registered.
    Connect(String),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Outcome::Fail)
    }
}

const HELP: &str = "\
Commands:
  new <type> <name> [host]  create a brick (Switch, Tap, Capture, Wire, Wirefilter,
                            TunnelListen, TunnelConnect, Qemu, Router,
                            SwitchWrapper) or an Event
  list | ls                 list bricks and events
  socks                     list socks
  connections               list plug to sock links
  ps                        list running bricks
  images ...                list, add, del or set readonly a disk image
  control <host> <pass>     connect to a remote engine
  reset all                 stop and delete everything
  <name> <action> ...       on, off, remove, show, connect <sock>,
                            disconnect, config <k>=<v>, rename <new>, dup, help
  q | quit                  leave the console
";

/// Split a line into words. Quotes group words and are removed.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), '\\') => word.extend(chars.next()),
            (Some(_), c) => word.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            (None, c) => {
                word.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err(CoreError::Parse {
            line: 0,
            reason: "unterminated quote".to_string(),
        });
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// Quote `word` so that [`tokenize`] yields it back as a single word.
///
/// Words made only of safe characters are returned as they are. Others are
/// wrapped in double quotes with `"`, `\`, `$` and `` ` `` escaped, which the
/// host shell reads back the same way.
pub fn quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./=:,+@%^".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        return word.to_string();
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('"');
    for c in word.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Interpret one command line against the factory.
///
/// Output meant for the user goes to `out`; errors are printed there as
/// well and reported as [`Outcome::Fail`].
pub fn parse(factory: &mut Factory, line: &str, out: &mut dyn Write) -> Outcome {
    let words = match tokenize(line) {
        Ok(words) => words,
        Err(e) => return fail(out, line, &e),
    };
    let Some((command, rest)) = words.split_first() else {
        return Outcome::Ok;
    };
    let result = match command.as_str() {
        "q" | "quit" => return Outcome::Quit,
        "h" | "help" => write_out(out, HELP),
        "list" | "ls" => list(factory, out),
        "socks" => socks(factory, out),
        "connections" => connections(factory, out),
        "ps" => ps(factory, out),
        "images" => images(factory, rest, out),
        "new" => new(factory, rest),
        "reset" if rest.first().map(String::as_str) == Some("all") => {
            factory.reset_all();
            Ok(())
        }
        "control" => match rest {
            [host, password] => {
                let entry = factory.remote_host_entry(host);
                entry.password = password.clone();
                return Outcome::Connect(host.clone());
            }
            _ => Err(usage("control <host> <password>")),
        },
        name => brick_action(factory, name, rest, out),
    };
    match result {
        Ok(()) => Outcome::Ok,
        Err(e) => fail(out, line, &e),
    }
}

fn fail(out: &mut dyn Write, line: &str, error: &CoreError) -> Outcome {
    tracing::warn!(command = %line, error = %error, "Console command failed");
    let _ = writeln!(out, "Error: {error}");
    Outcome::Fail
}

fn usage(text: &str) -> CoreError {
    CoreError::invalid_value("usage", text.to_string())
}

fn write_out(out: &mut dyn Write, text: &str) -> Result<()> {
    out.write_all(text.as_bytes())?;
    Ok(())
}

fn new(factory: &mut Factory, rest: &[String]) -> Result<()> {
    match rest {
        [kind, name] if kind.eq_ignore_ascii_case("event") => factory.newevent(name),
        [kind, name] => factory.newbrick(kind, name, None).map(|_| ()),
        [kind, name, host] => factory.newbrick(kind, name, Some(host)).map(|_| ()),
        _ => Err(usage("new <type> <name> [host]")),
    }
}

/// Apply a verb to a named brick or event.
pub fn brick_action(
    factory: &mut Factory,
    name: &str,
    words: &[String],
    out: &mut dyn Write,
) -> Result<()> {
    let is_event = factory.event(name).is_some();
    if !is_event && factory.find_brick(name).is_none() {
        return Err(CoreError::NotFound(format!("no brick or event named {name}")));
    }
    let Some((verb, args)) = words.split_first() else {
        return Err(usage("<name> <action>"));
    };

    match (verb.as_str(), args) {
        ("on", []) => factory.poweron(name),
        ("off", []) => factory.poweroff(name),
        ("remove", []) => factory.remove(name),
        ("config", []) => Err(usage("<name> config <key>=<value>")),
        ("config", words) => factory.configure(name, words),
        ("show", []) => show(factory, name, out),
        ("connect", [sock]) if !is_event => factory.connect_to(name, sock).map(|_| ()),
        ("disconnect", []) if !is_event => factory.disconnect(name),
        ("rename", [new_name]) => factory.rename(name, new_name),
        ("dup", []) if is_event => factory.dupevent(name).map(|_| ()),
        ("dup", []) => factory.dupbrick(name).map(|_| ()),
        ("help", []) => {
            let text = match factory.brick(name) {
                Some(brick) => brick.kind.help(),
                None => "Event parameters:\n  delay\n  actions\nActions: config add <cmd>, config addsh <cmd>\n".into(),
            };
            write_out(out, &text)
        }
        _ => Err(usage(&format!("unknown action for {name}: {}", words.join(" ")))),
    }
}

fn show(factory: &Factory, name: &str, out: &mut dyn Write) -> Result<()> {
    if let Some(event) = factory.event(name) {
        writeln!(out, "{} ({})", event.name, crate::event::Event::TYPE_NAME)?;
        writeln!(out, "  delay={}", event.delay())?;
        for action in &event.actions {
            writeln!(out, "  {}", action.to_line())?;
        }
        return Ok(());
    }
    let id = factory
        .find_brick(name)
        .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
    let Some(brick) = factory.brick_by_id(id) else {
        return Ok(());
    };
    let state = if brick.is_running() { "running" } else { "stopped" };
    writeln!(out, "{} ({}) {state}", brick.name, brick.type_name())?;
    if let Some(host) = &brick.homehost {
        writeln!(out, "  homehost={host}")?;
    }
    for (key, value) in brick.config.string_pairs() {
        writeln!(out, "  {key}={value}")?;
    }
    if let Some(argv) = factory.command_line(id) {
        writeln!(out, "  command: {}", argv.join(" "))?;
    }
    Ok(())
}

fn list(factory: &Factory, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "Bricks:")?;
    for brick in factory.bricks() {
        let host = brick
            .homehost
            .as_deref()
            .map(|h| format!(" [{h}]"))
            .unwrap_or_default();
        writeln!(
            out,
            "  {} ({}){host}: {}",
            brick.name,
            brick.type_name(),
            factory.summary(brick.id)
        )?;
    }
    writeln!(out, "Events:")?;
    for event in factory.events() {
        writeln!(out, "  {}: {}", event.name, event.summary())?;
    }
    Ok(())
}

fn socks(factory: &Factory, out: &mut dyn Write) -> Result<()> {
    for (_, sock) in factory.links.socks() {
        let owner = factory
            .brick_by_id(sock.brick)
            .map(|b| b.name.as_str())
            .unwrap_or("?");
        writeln!(
            out,
            "{} ({owner}) {} [{} plugs]",
            sock.nickname,
            sock.path.display(),
            sock.plugs.len()
        )?;
    }
    Ok(())
}

fn connections(factory: &Factory, out: &mut dyn Write) -> Result<()> {
    for brick in factory.bricks() {
        for (index, plug) in brick
            .plugs
            .iter()
            .filter_map(|p| factory.links.plug(*p))
            .enumerate()
        {
            let target = match (plug.mode, plug.sock.and_then(|s| factory.links.sock(s))) {
                (PlugMode::User, _) => "user".to_string(),
                (PlugMode::HostOnly, _) => "hostonly".to_string(),
                (PlugMode::Vde, Some(sock)) => sock.nickname.clone(),
                (PlugMode::Vde, None) => "(disconnected)".to_string(),
            };
            writeln!(out, "{} plug {index} -> {target}", brick.name)?;
        }
    }
    Ok(())
}

fn ps(factory: &Factory, out: &mut dyn Write) -> Result<()> {
    for brick in factory.bricks().filter(|b| b.is_running()) {
        match (brick.pid(), &brick.homehost) {
            (Some(pid), _) => writeln!(out, "{} pid {pid}", brick.name)?,
            (None, Some(host)) => writeln!(out, "{} on {host}", brick.name)?,
            (None, None) => writeln!(out, "{} (in process)", brick.name)?,
        }
    }
    for event in factory.events().filter(|e| e.is_running()) {
        writeln!(out, "{} every {}s", event.name, event.delay())?;
    }
    Ok(())
}

fn images(factory: &mut Factory, rest: &[String], out: &mut dyn Write) -> Result<()> {
    let parse_on_off = |v: &str| match v {
        "on" | "true" | "True" => Ok(true),
        "off" | "false" | "False" => Ok(false),
        other => Err(CoreError::invalid_value("readonly", format!("expected on or off, got {other}"))),
    };
    match rest {
        [] => list_images(factory, out),
        [verb] if verb == "list" => list_images(factory, out),
        [verb, name, path] if verb == "add" => factory.add_image(name, path, None),
        [verb, name, path, host] if verb == "add" => factory.add_image(name, path, Some(host)),
        [verb, name] if verb == "del" => factory.del_image(name),
        [verb, name, flag] if verb == "readonly" => {
            let readonly = parse_on_off(flag)?;
            factory.set_image_readonly(name, readonly)
        }
        _ => Err(usage(
            "images [list | add <name> <path> [host] | del <name> | readonly <name> on|off]",
        )),
    }
}

fn list_images(factory: &Factory, out: &mut dyn Write) -> Result<()> {
    for image in factory.images.values() {
        let mut flags = Vec::new();
        if image.readonly {
            flags.push("readonly".to_string());
        }
        if let Some(host) = &image.host {
            flags.push(format!("host={host}"));
        }
        if let Some(master) = &image.master {
            flags.push(format!("master={master}"));
        }
        writeln!(
            out,
            "{} {} [{}] users: {}",
            image.name,
            image.path.display(),
            flags.join(" "),
            image.users.iter().cloned().collect::<Vec<_>>().join(",")
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;
    use crate::settings::Settings;

    fn run(factory: &mut Factory, line: &str) -> (Outcome, String) {
        let mut out = Vec::new();
        let outcome = parse(factory, line, &mut out);
        (outcome, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"ev1 config addsh echo "a b" 'c'"#).unwrap(),
            vec!["ev1", "config", "addsh", "echo", "a b", "c"]
        );
        assert_eq!(tokenize("x config kopt='ro quiet'").unwrap(), vec!["x", "config", "kopt=ro quiet"]);
        assert_eq!(tokenize("a ''").unwrap(), vec!["a", ""]);
        assert!(tokenize("a 'b").is_err());
        assert!(tokenize("   ").unwrap().is_empty());
    }

    #[test]
    fn test_quote_survives_tokenize() {
        assert_eq!(quote("numports"), "numports");
        assert_eq!(quote("/srv/disk.img"), "/srv/disk.img");
        assert_eq!(quote("ro quiet"), "\"ro quiet\"");
        for word in ["ro quiet", "it's", "say \"hi\"", "back\\slash", "$HOME", "a;b", ""] {
            let line = format!("x {}", quote(word));
            assert_eq!(tokenize(&line).unwrap(), vec!["x".to_string(), word.to_string()]);
        }
    }

    #[test]
    fn test_host_action_keeps_quoted_argument() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = Factory::new(Settings::rooted_at(dir.path()));
        run(&mut f, "new event ev1");
        assert_eq!(run(&mut f, r#"ev1 config addsh echo "a   b""#).0, Outcome::Ok);
        assert_eq!(
            f.event("ev1").unwrap().actions,
            vec![Action::HostShell(r#"echo "a   b""#.into())]
        );
    }

    #[test]
    fn test_build_topology() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = Factory::new(Settings::rooted_at(dir.path()));

        assert_eq!(run(&mut f, "new switch sw1").0, Outcome::Ok);
        assert_eq!(run(&mut f, "new wirefilter wf1").0, Outcome::Ok);
        assert_eq!(run(&mut f, "wf1 connect sw1_port").0, Outcome::Ok);
        assert_eq!(run(&mut f, "wf1 config delay=10 loss=2").0, Outcome::Ok);
        assert_eq!(run(&mut f, "new Event ev1").0, Outcome::Ok);
        assert_eq!(run(&mut f, "ev1 config add wf1 off").0, Outcome::Ok);

        let (_, listing) = run(&mut f, "ls");
        assert!(listing.contains("sw1 (Switch)"));
        assert!(listing.contains("ev1: Delay: 0s, Actions: add wf1 off"));
        let (_, links) = run(&mut f, "connections");
        assert!(links.contains("wf1 plug 0 -> sw1_port"));
        assert!(links.contains("wf1 plug 1 -> (disconnected)"));
        let (_, shown) = run(&mut f, "wf1 show");
        assert!(shown.contains("delay=10"));

        assert_eq!(run(&mut f, "wf1 rename filter").0, Outcome::Ok);
        assert_eq!(run(&mut f, "filter dup").0, Outcome::Ok);
        assert!(f.brick("Copy_of_filter").is_some());
    }

    #[test]
    fn test_failures_report_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = Factory::new(Settings::rooted_at(dir.path()));

        let (outcome, text) = run(&mut f, "new switch 9lives");
        assert_eq!(outcome, Outcome::Fail);
        assert!(text.starts_with("Error:"));
        assert_eq!(run(&mut f, "ghost on").0, Outcome::Fail);
        assert_eq!(run(&mut f, "new toaster t").0, Outcome::Fail);
        f.newbrick("wire", "w1", None).unwrap();
        assert_eq!(run(&mut f, "w1 on").0, Outcome::Fail);
        assert_eq!(run(&mut f, "w1 dance").0, Outcome::Fail);
        assert_eq!(run(&mut f, "").0, Outcome::Ok);
        assert_eq!(run(&mut f, "quit").0, Outcome::Quit);
    }

    #[test]
    fn test_images_and_control() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = Factory::new(Settings::rooted_at(dir.path()));

        assert_eq!(run(&mut f, "images add deb /srv/deb.img").0, Outcome::Ok);
        assert_eq!(run(&mut f, "images readonly deb on").0, Outcome::Ok);
        let (_, text) = run(&mut f, "images");
        assert!(text.contains("deb /srv/deb.img [readonly]"));
        assert_eq!(run(&mut f, "images readonly deb maybe").0, Outcome::Fail);
        assert_eq!(run(&mut f, "images del deb").0, Outcome::Ok);
        assert!(f.images.is_empty());

        assert_eq!(
            run(&mut f, "control 10.0.0.7 pw").0,
            Outcome::Connect("10.0.0.7".into())
        );
        assert_eq!(f.remote_hosts["10.0.0.7"].password, "pw");
    }

    #[test]
    fn test_reset_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = Factory::new(Settings::rooted_at(dir.path()));
        run(&mut f, "new switch sw1");
        run(&mut f, "new event ev1");
        assert_eq!(run(&mut f, "reset all").0, Outcome::Ok);
        assert_eq!(f.bricks().count(), 0);
        assert_eq!(f.events().count(), 0);
        assert_eq!(run(&mut f, "reset").0, Outcome::Fail);
    }
}
