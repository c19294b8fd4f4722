//! Project file persistence.
//!
//! A project is a plain text file of `[Type:Name]` sections followed by
//! pipe-delimited link records:
//!
//! ```text
//! [Project:/home/me/lab.vbl]
//! id=3
//! name=lab
//!
//! [RemoteHost:10.0.0.2]      (port, password, basepath, autoconnect)
//! [DiskImage:debian]         (path, host, readonly)
//! [Event:ev1]                (delay, actions=['add sw1 on'])
//! [Switch:sw1]               (non-default config values, homehost)
//!
//! sock|vm1|vm1_sock_eth0|e1000|00:aa:12:34:56:78|0
//! link|w1|sw1_port
//! link|vm1|sw1_port|rtl8139|00:aa:9a:bc:de:f0|0
//! userlink|vm1||rtl8139|00:aa:01:02:03:04|0
//! hostonly|vm1||rtl8139|00:aa:05:06:07:08|0
//! ```
//!
//! Restore is a single forward pass: link records are resolved against the
//! bricks created so far, so they are always written last.
//!
//! Before a save overwrites the project file, the previous file is copied to
//! a backup path and the backup is removed once the new file is complete. A
//! backup found at restore time means a save crashed: it is promoted back
//! and the partial file is kept as `<file>.back`.

use crate::config::{split_assignment, LineCursor};
use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::factory::Factory;
use crate::image::DiskImage;
use crate::link::{Nic, PlugMode};
use crate::remote::RemoteHost;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const PROJECT_SECTION: &str = "Project";
const REMOTE_SECTION: &str = "RemoteHost";
const IMAGE_SECTION: &str = "DiskImage";

// ============================================================================
// Save
// ============================================================================

/// Save the whole topology to `path`.
///
/// A project id is allocated on first save and the settings are persisted
/// to record it.
pub fn save(factory: &mut Factory, path: &Path) -> Result<()> {
    if factory.project.id == 0 {
        factory.project.id = factory.settings.next_project_id();
        if let Some(settings_path) = factory.settings_path.clone() {
            factory.settings.save(&settings_path)?;
        }
    }
    factory.project.filename = path.to_path_buf();
    if factory.project.name.is_empty() {
        factory.project.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }

    let text = to_text(factory);
    let backup = factory.settings.backup_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        if let Some(parent) = backup.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(path, &backup)?;
    }
    std::fs::write(path, text)?;
    if backup.exists() {
        std::fs::remove_file(&backup)?;
    }
    tracing::info!(
        path = %path.display(),
        bricks = factory.bricks().count(),
        events = factory.events().count(),
        "Project saved"
    );
    Ok(())
}

/// Serialize the topology.
pub fn to_text(factory: &Factory) -> String {
    let mut out = String::new();
    let project = &factory.project;
    let _ = writeln!(out, "[{PROJECT_SECTION}:{}]", project.filename.display());
    let _ = writeln!(out, "id={}", project.id);
    let _ = writeln!(out, "name={}", project.name);
    let _ = writeln!(out, "filename={}", project.filename.display());
    out.push('\n');

    for host in factory.remote_hosts.values() {
        host.save_to(&mut out);
    }
    for image in factory.images.values() {
        image.save_to(&mut out);
    }
    for event in factory.events() {
        event.save_to(&mut out);
    }
    for brick in factory.bricks() {
        brick.config.save_to(&mut out, brick.type_name(), &brick.name);
        if let Some(host) = &brick.homehost {
            let _ = writeln!(out, "homehost={host}");
        }
        out.push('\n');
    }

    for brick in factory.bricks() {
        for sock in brick.socks.iter().filter_map(|s| factory.links.sock(*s)) {
            if let Some(nic) = &sock.nic {
                let _ = writeln!(
                    out,
                    "sock|{}|{}|{}|{}|{}",
                    brick.name, sock.nickname, nic.model, nic.mac, nic.vlan
                );
            }
        }
    }
    for brick in factory.bricks() {
        for plug in brick.plugs.iter().filter_map(|p| factory.links.plug(*p)) {
            let (record, sock) = match plug.mode {
                PlugMode::Vde => match plug.sock.and_then(|s| factory.links.sock(s)) {
                    Some(sock) => ("link", sock.nickname.as_str()),
                    None => continue,
                },
                PlugMode::User => ("userlink", ""),
                PlugMode::HostOnly => ("hostonly", ""),
            };
            let _ = write!(out, "{record}|{}|{sock}", brick.name);
            if let Some(nic) = &plug.nic {
                let _ = write!(out, "|{}|{}|{}", nic.model, nic.mac, nic.vlan);
            }
            out.push('\n');
        }
    }
    out
}

// ============================================================================
// Restore
// ============================================================================

/// Replace the topology with the project stored at `path`.
pub fn restore(factory: &mut Factory, path: &Path) -> Result<()> {
    recover_crashed_save(&factory.settings.backup_path(), path)?;
    let text = std::fs::read_to_string(path)?;
    factory.reset_all();
    restore_text(factory, &text)?;
    factory.project.filename = path.to_path_buf();
    tracing::info!(
        path = %path.display(),
        bricks = factory.bricks().count(),
        events = factory.events().count(),
        "Project restored"
    );
    Ok(())
}

/// Path keeping a project file that a crashed save left behind.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".back");
    PathBuf::from(name)
}

fn recover_crashed_save(backup: &Path, path: &Path) -> Result<()> {
    if !backup.exists() {
        return Ok(());
    }
    tracing::warn!(
        backup = %backup.display(),
        path = %path.display(),
        "Previous save did not complete, restoring backup"
    );
    if path.exists() {
        std::fs::rename(path, partial_path(path))?;
    }
    std::fs::copy(backup, path)?;
    std::fs::remove_file(backup)?;
    Ok(())
}

/// Apply a serialized project to the factory.
///
/// Unknown sections, incomplete images, bad values and dangling link
/// records are logged and skipped.
pub fn restore_text(factory: &mut Factory, text: &str) -> Result<()> {
    let mut cursor = LineCursor::new(text);
    while let Some(line) = cursor.next_line() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some((kind, name)) = section_header(line) {
            restore_section(factory, kind, name, &mut cursor)?;
        } else if line.contains('|') {
            restore_record(factory, line, cursor.line_no());
        } else {
            tracing::warn!(line = cursor.line_no(), text = line, "Ignoring stray project line");
        }
    }
    Ok(())
}

fn section_header(line: &str) -> Option<(&str, &str)> {
    let inner = line.strip_prefix('[')?.strip_suffix(']')?;
    let (kind, name) = inner.split_once(':')?;
    Some((kind.trim(), name.trim()))
}

/// Consume the assignment lines of a section body.
fn section_body(cursor: &mut LineCursor) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    while let Some(line) = cursor.peek() {
        if line.trim().is_empty() {
            cursor.next_line();
            break;
        }
        let Some((key, value)) = split_assignment(line) else {
            break;
        };
        pairs.push((key.to_string(), value.to_string()));
        cursor.next_line();
    }
    pairs
}

fn restore_section(
    factory: &mut Factory,
    kind: &str,
    name: &str,
    cursor: &mut LineCursor,
) -> Result<()> {
    match kind {
        PROJECT_SECTION => {
            for (key, value) in section_body(cursor) {
                match key.as_str() {
                    "id" => factory.project.id = value.trim().parse().unwrap_or(0),
                    "name" => factory.project.name = value,
                    "filename" => factory.project.filename = PathBuf::from(value.trim()),
                    other => tracing::warn!(key = other, "Ignoring unknown project key"),
                }
            }
        }
        REMOTE_SECTION => match RemoteHost::load_from(name, cursor) {
            Ok(host) => {
                factory.remote_hosts.insert(host.addr.clone(), host);
            }
            Err(e) => tracing::warn!(host = %name, error = %e, "Skipping remote host section"),
        },
        IMAGE_SECTION => match DiskImage::load_from(name, cursor) {
            Ok(image) => {
                factory.images.insert(image.name.clone(), image);
            }
            Err(e) => tracing::warn!(image = %name, error = %e, "Skipping disk image section"),
        },
        Event::TYPE_NAME => {
            let body = section_body(cursor);
            if let Err(e) = factory.newevent(name) {
                tracing::warn!(event = %name, error = %e, "Skipping event section");
                return Ok(());
            }
            for (key, value) in body {
                let word = format!("{key}={value}");
                if let Err(e) = factory.configure(name, &[word]) {
                    tracing::warn!(event = %name, key = %key, error = %e, "Skipping event value");
                }
            }
        }
        brick_type => {
            let body = section_body(cursor);
            if let Err(e) = factory.newbrick(brick_type, name, None) {
                tracing::warn!(brick = %name, kind = brick_type, error = %e, "Skipping brick section");
                return Ok(());
            }
            let (homehost, values): (Vec<_>, Vec<_>) =
                body.into_iter().partition(|(key, _)| key == "homehost");
            for (key, value) in values.into_iter().chain(homehost) {
                let word = format!("{key}={value}");
                if let Err(e) = factory.configure(name, &[word]) {
                    tracing::warn!(brick = %name, key = %key, error = %e, "Skipping brick value");
                }
            }
        }
    }
    Ok(())
}

/// A `sock|`, `link|`, `userlink|` or `hostonly|` record.
#[derive(Debug, PartialEq, Eq)]
struct Record<'a> {
    kind: &'a str,
    owner: &'a str,
    sock: &'a str,
    nic: Option<Nic>,
}

fn parse_record(line: &str) -> Option<Record<'_>> {
    let fields: Vec<&str> = line.split('|').collect();
    let (kind, owner, sock) = match fields.as_slice() {
        [kind, owner, sock, ..] => (*kind, *owner, *sock),
        _ => return None,
    };
    let nic = match fields.get(3..6) {
        Some([model, mac, vlan]) => Some(Nic::new(*model, *mac, vlan.trim().parse().unwrap_or(0))),
        _ => None,
    };
    Some(Record {
        kind,
        owner,
        sock,
        nic,
    })
}

fn restore_record(factory: &mut Factory, line: &str, line_no: usize) {
    let Some(record) = parse_record(line) else {
        tracing::warn!(line = line_no, text = line, "Malformed link record");
        return;
    };
    if let Err(e) = apply_record(factory, &record) {
        tracing::warn!(line = line_no, owner = record.owner, error = %e, "Link record not restored");
    }
}

fn apply_record(factory: &mut Factory, record: &Record<'_>) -> Result<()> {
    if factory.find_brick(record.owner).is_none() {
        return Err(CoreError::NotFound(format!("brick {}", record.owner)));
    }
    let mode = match record.kind {
        "sock" => {
            let nic = record
                .nic
                .as_ref()
                .ok_or_else(|| CoreError::invalid_value("sock", "missing NIC fields"))?;
            let sock = factory.add_vm_sock(record.owner, &nic.model, &nic.mac)?;
            if let Some(s) = factory.links.sock_mut(sock) {
                if !record.sock.is_empty() {
                    s.nickname = record.sock.to_string();
                }
                if let Some(n) = s.nic.as_mut() {
                    n.vlan = nic.vlan;
                }
            }
            return Ok(());
        }
        "link" => PlugMode::Vde,
        "userlink" => PlugMode::User,
        "hostonly" => PlugMode::HostOnly,
        other => return Err(CoreError::invalid_value(other, "unknown record kind")),
    };

    let Some(nic) = &record.nic else {
        factory.connect_to(record.owner, record.sock)?;
        return Ok(());
    };
    let sock = (mode == PlugMode::Vde).then_some(record.sock);
    let plug = factory.add_vm_plug(record.owner, sock, mode, &nic.model, &nic.mac)?;
    if let Some(n) = factory.links.plug_mut(plug).and_then(|p| p.nic.as_mut()) {
        n.vlan = nic.vlan;
    }
    Ok(())
}
