//! The factory: owner of every brick, event, sock, disk image and remote
//! host, and the lifecycle state machine driving them.
//!
//! All mutation goes through one [`Factory`] value. Concurrent callers share
//! it through an [`Engine`], which wraps it in a single coarse lock.

use crate::bricks::{brick_type, random_mac, Brick, BrickType, BuildContext, PlugView, SockView};
use crate::config::{parse_assignment, Parameter, Value};
use crate::error::{CoreError, Result};
use crate::event::{spawn_host_action, Action, Event};
use crate::image::DiskImage;
use crate::link::{BrickId, LinkGraph, Nic, PlugId, PlugMode, SockId};
use crate::process::{run_host_command, BrickProcess, SpawnRequest, SudoSpec};
use crate::remote::{RemoteHost, RemoteLink};
use crate::settings::Settings;
use crate::vde::{bridge, Endpoint, VdePort};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

/// Config keys every brick carries: events fired after start and stop.
const PON_EVENT: &str = "pon_vbevent";
const POFF_EVENT: &str = "poff_vbevent";

// ============================================================================
// Notifications
// ============================================================================

/// State changes published by the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryEvent {
    BrickStarted(String),
    BrickStopped(String),
    /// Created, configured, renamed or relinked.
    BrickChanged(String),
    BrickRemoved(String),
    EventStarted(String),
    EventStopped(String),
    EventAccomplished(String),
    /// A wire bridged to UDP is listening on `port`.
    UdpPort { brick: String, port: u16 },
    /// Process errors, which are never returned to callers.
    Error(String),
    RemoteHostsChanged,
    ImagesChanged,
}

/// How a local brick is brought up.
enum StartPlan {
    Spawn(SpawnRequest),
    Bridge,
    /// Nothing to run; the brick only marks itself active.
    Passive,
}

/// Identity of the loaded project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectParams {
    /// `0` until the project is first saved.
    pub id: u64,
    pub name: String,
    pub filename: PathBuf,
}

// ============================================================================
// Factory
// ============================================================================

/// Owner of the topology.
#[derive(Debug)]
pub struct Factory {
    pub settings: Settings,
    /// Where `settings` is persisted, if anywhere.
    pub settings_path: Option<PathBuf>,
    pub project: ProjectParams,
    pub links: LinkGraph,
    pub images: BTreeMap<String, DiskImage>,
    pub remote_hosts: BTreeMap<String, RemoteHost>,
    /// Set while a remote peer drives this engine: link checks are skipped.
    pub server_mode: bool,
    bricks: BTreeMap<BrickId, Brick>,
    events: Vec<Event>,
    next_brick: u64,
    notifier: broadcast::Sender<FactoryEvent>,
    engine: Weak<Mutex<Factory>>,
    runtime: Option<Handle>,
}

impl Factory {
    /// Create an empty factory.
    pub fn new(settings: Settings) -> Self {
        if let Err(e) = settings.ensure_dirs() {
            tracing::warn!(error = %e, "Engine directories unavailable");
        }
        let (notifier, _) = broadcast::channel(256);
        let project = ProjectParams {
            filename: settings.current_project.clone(),
            ..ProjectParams::default()
        };
        Self {
            settings,
            settings_path: None,
            project,
            links: LinkGraph::new(),
            images: BTreeMap::new(),
            remote_hosts: BTreeMap::new(),
            server_mode: false,
            bricks: BTreeMap::new(),
            events: Vec::new(),
            next_brick: 0,
            notifier,
            engine: Weak::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<FactoryEvent> {
        self.notifier.subscribe()
    }

    pub(crate) fn emit(&self, event: FactoryEvent) {
        let _ = self.notifier.send(event);
    }

    /// Runtime used for event timers and in-process wires.
    pub fn set_runtime(&mut self, runtime: Handle) {
        self.runtime = Some(runtime);
    }

    // ------------------------------------------------------------------------
    // Names and lookups
    // ------------------------------------------------------------------------

    /// Normalize a user supplied name.
    ///
    /// Surrounding blanks are trimmed and inner spaces become `_`. The
    /// result must start with a letter and contain only letters, digits,
    /// `_`, `.` and `-`.
    pub fn valid_name(name: &str) -> Result<String> {
        let name = name.trim().replace(' ', "_");
        let mut chars = name.chars();
        let starts_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        if !starts_ok
            || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            return Err(CoreError::InvalidName(name));
        }
        Ok(name)
    }

    /// Whether a brick or event already uses `name`.
    pub fn name_in_use(&self, name: &str) -> bool {
        self.bricks.values().any(|b| b.name == name) || self.events.iter().any(|e| e.name == name)
    }

    fn fresh_name(&self, name: &str) -> Result<String> {
        let name = Self::valid_name(name)?;
        if self.name_in_use(&name) {
            return Err(CoreError::InvalidName(format!("{name} is already in use")));
        }
        Ok(name)
    }

    pub fn find_brick(&self, name: &str) -> Option<BrickId> {
        self.bricks
            .iter()
            .find(|(_, b)| b.name == name)
            .map(|(id, _)| *id)
    }

    fn brick_id(&self, name: &str) -> Result<BrickId> {
        self.find_brick(name)
            .ok_or_else(|| CoreError::NotFound(format!("brick {name}")))
    }

    pub fn brick(&self, name: &str) -> Option<&Brick> {
        self.find_brick(name).and_then(|id| self.bricks.get(&id))
    }

    pub fn brick_by_id(&self, id: BrickId) -> Option<&Brick> {
        self.bricks.get(&id)
    }

    /// Bricks in creation order.
    pub fn bricks(&self) -> impl Iterator<Item = &Brick> {
        self.bricks.values()
    }

    pub fn event(&self, name: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.name == name)
    }

    fn event_mut(&mut self, name: &str) -> Result<&mut Event> {
        self.events
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| CoreError::NotFound(format!("event {name}")))
    }

    /// Events in creation order.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Command line context of a brick.
    pub fn context(&self, id: BrickId) -> Option<BuildContext<'_>> {
        let brick = self.bricks.get(&id)?;
        let plugs = brick
            .plugs
            .iter()
            .filter_map(|p| self.links.plug(*p))
            .map(|plug| {
                let sock = plug.sock.and_then(|s| self.links.sock(s));
                PlugView {
                    mode: plug.mode,
                    nic: plug.nic.clone(),
                    sock_path: sock.map(|s| s.path.clone()),
                    sock_name: sock.map(|s| s.nickname.clone()),
                }
            })
            .collect();
        let socks = brick
            .socks
            .iter()
            .filter_map(|s| self.links.sock(*s))
            .map(|s| SockView {
                nickname: s.nickname.clone(),
                path: s.path.clone(),
                nic: s.nic.clone(),
            })
            .collect();
        Some(BuildContext {
            name: &brick.name,
            config: &brick.config,
            settings: &self.settings,
            plugs,
            socks,
            images: &self.images,
        })
    }

    /// Summary line of a brick for listings.
    pub fn summary(&self, id: BrickId) -> String {
        match (self.bricks.get(&id), self.context(id)) {
            (Some(brick), Some(ctx)) => brick.kind.summary(&ctx),
            _ => String::new(),
        }
    }

    /// Whether the brick has everything it needs to start.
    pub fn configured(&self, id: BrickId) -> bool {
        match (self.bricks.get(&id), self.context(id)) {
            (Some(brick), Some(ctx)) => brick.kind.configured(&ctx),
            _ => false,
        }
    }

    /// Whether every plug of the brick is configured.
    pub fn properly_connected(&self, id: BrickId) -> bool {
        self.bricks.get(&id).is_some_and(|b| {
            b.plugs
                .iter()
                .all(|p| self.links.plug(*p).is_some_and(|p| p.configured()))
        })
    }

    /// Program and arguments a brick would be started with.
    pub fn command_line(&self, id: BrickId) -> Option<Vec<String>> {
        let brick = self.bricks.get(&id)?;
        let ctx = self.context(id)?;
        let prog = brick.kind.prog(&self.settings, &brick.config)?;
        let mut argv = vec![prog.display().to_string()];
        argv.extend(brick.kind.args(&ctx));
        Some(argv)
    }

    // ------------------------------------------------------------------------
    // Creation and deletion
    // ------------------------------------------------------------------------

    /// Create a brick of `type_name`, optionally hosted on `homehost`.
    pub fn newbrick(&mut self, type_name: &str, name: &str, homehost: Option<&str>) -> Result<BrickId> {
        let name = self.fresh_name(name)?;
        let kind = brick_type(type_name, &self.settings)
            .ok_or_else(|| CoreError::UnmanagedType(type_name.to_string()))?;
        if let Some(host) = homehost {
            if !self.remote_hosts.contains_key(host) {
                return Err(CoreError::NotFound(format!("remote host {host}")));
            }
        }
        let id = self.insert_brick(kind, name.clone());
        if let Some(host) = homehost {
            let type_name = self.bricks[&id].type_name();
            if let Some(brick) = self.bricks.get_mut(&id) {
                brick.homehost = Some(host.to_string());
            }
            self.send_to_host(host, &format!("new {type_name} {name}"));
        }
        tracing::info!(brick = %name, kind = type_name, "Brick created");
        self.emit(FactoryEvent::BrickChanged(name));
        Ok(id)
    }

    fn insert_brick(&mut self, kind: Box<dyn BrickType>, name: String) -> BrickId {
        self.next_brick += 1;
        let id = BrickId(self.next_brick);
        let mut brick = Brick::new(id, name, kind);
        brick.kind.init_config(&mut brick.config);
        brick.config.add_parameter(PON_EVENT, Parameter::Str(""));
        brick.config.add_parameter(POFF_EVENT, Parameter::Str(""));

        if let Some(path) = brick
            .kind
            .own_sock_path(&brick.name, &brick.config, &self.settings)
        {
            let sock = self
                .links
                .add_sock(id, &format!("{}_port", brick.name), path);
            brick.socks.push(sock);
        }
        for _ in 0..brick.kind.initial_plugs() {
            brick.plugs.push(self.links.add_plug(id));
        }
        self.bricks.insert(id, brick);
        id
    }

    /// Create an event.
    pub fn newevent(&mut self, name: &str) -> Result<()> {
        let name = self.fresh_name(name)?;
        tracing::info!(event = %name, "Event created");
        self.events.push(Event::new(name.clone()));
        self.emit(FactoryEvent::BrickChanged(name));
        Ok(())
    }

    /// Delete a brick, detaching every plug that pointed at its socks.
    pub fn delbrick(&mut self, name: &str) -> Result<()> {
        let id = self.brick_id(name)?;
        self.poweroff(name)?;
        if self.bricks[&id].is_remote() {
            self.forward(id, &format!("{name} remove"));
        }
        let Some(brick) = self.bricks.remove(&id) else {
            return Ok(());
        };

        for sock in &brick.socks {
            for plug in self.links.remove_sock(*sock) {
                let Some(owner) = self.links.plug(plug).map(|p| p.brick) else {
                    continue;
                };
                let Some(other) = self.bricks.get_mut(&owner) else {
                    continue;
                };
                if other.kind.dynamic_plugs() {
                    other.plugs.retain(|p| *p != plug);
                    self.links.remove_plug(plug);
                }
                let other = other.name.clone();
                tracing::debug!(brick = %other, sock = %sock, "Plug detached by cascade");
                self.emit(FactoryEvent::BrickChanged(other));
            }
        }
        for plug in &brick.plugs {
            self.links.remove_plug(*plug);
        }
        for image in self.images.values_mut() {
            image.users.remove(&brick.name);
            image.release_master(&brick.name);
        }

        tracing::info!(brick = %name, "Brick deleted");
        self.emit(FactoryEvent::BrickRemoved(name.to_string()));
        Ok(())
    }

    /// Delete an event, stopping it first.
    pub fn delevent(&mut self, name: &str) -> Result<()> {
        self.stop_event(name)?;
        self.events.retain(|e| e.name != name);
        tracing::info!(event = %name, "Event deleted");
        self.emit(FactoryEvent::BrickRemoved(name.to_string()));
        Ok(())
    }

    /// Delete a brick or an event by name.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.event(name).is_some() {
            self.delevent(name)
        } else {
            self.delbrick(name)
        }
    }

    fn copy_name(&self, name: &str) -> String {
        let mut copy = format!("Copy_of_{name}");
        while self.name_in_use(&copy) {
            copy.push_str("_new");
        }
        copy
    }

    /// Duplicate a brick as `Copy_of_<name>`.
    ///
    /// Non-object config values are copied and every plug is reconnected
    /// to the same sock. VM NICs get fresh MAC addresses.
    pub fn dupbrick(&mut self, name: &str) -> Result<String> {
        let src = self.brick_id(name)?;
        let copy_name = self.copy_name(name);
        let (kind, pairs, homehost) = {
            let brick = &self.bricks[&src];
            (brick.kind.clone_box(), brick.config.string_pairs(), brick.homehost.clone())
        };
        let plugs: Vec<_> = self.bricks[&src]
            .plugs
            .iter()
            .filter_map(|p| self.links.plug(*p).cloned())
            .collect();
        let socks: Vec<_> = self.bricks[&src]
            .socks
            .iter()
            .filter_map(|s| self.links.sock(*s).cloned())
            .filter(|s| s.nic.is_some())
            .collect();

        let id = self.insert_brick(kind, copy_name.clone());
        {
            let brick = self
                .bricks
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(copy_name.clone()))?;
            for (key, text) in &pairs {
                if key == "uuid" {
                    continue;
                }
                if let Err(e) = brick.config.set_string(key, text) {
                    tracing::warn!(brick = %copy_name, error = %e, "Value not copied");
                }
            }
            brick.homehost = homehost;
        }

        for (index, plug) in plugs.iter().enumerate() {
            let nic = plug.nic.as_ref().map(|n| Nic::new(&n.model, random_mac(), n.vlan));
            let target = match self.bricks[&id].plugs.get(index) {
                Some(existing) => *existing,
                None => {
                    let new = self.links.add_plug(id);
                    if let Some(brick) = self.bricks.get_mut(&id) {
                        brick.plugs.push(new);
                    }
                    new
                }
            };
            self.links.connect(target, plug.sock);
            if let Some(p) = self.links.plug_mut(target) {
                p.mode = plug.mode;
                p.nic = nic;
            }
        }
        for sock in socks {
            if let Some(nic) = sock.nic {
                self.add_vm_sock(&copy_name, &nic.model, &random_mac())?;
            }
        }
        self.bind_disks(id);

        tracing::info!(brick = %name, copy = %copy_name, "Brick duplicated");
        self.emit(FactoryEvent::BrickChanged(copy_name.clone()));
        Ok(copy_name)
    }

    /// Duplicate an event as `Copy_of_<name>`.
    pub fn dupevent(&mut self, name: &str) -> Result<String> {
        let (config, actions) = {
            let event = self
                .event(name)
                .ok_or_else(|| CoreError::NotFound(format!("event {name}")))?;
            (event.config.clone(), event.actions.clone())
        };
        let copy_name = self.copy_name(name);
        let mut event = Event::new(copy_name.clone());
        event.config = config;
        event.actions = actions;
        self.events.push(event);
        self.emit(FactoryEvent::BrickChanged(copy_name.clone()));
        Ok(copy_name)
    }

    /// Rename a stopped brick or event.
    pub fn rename(&mut self, name: &str, new_name: &str) -> Result<()> {
        if self.event(name).is_some() {
            self.rename_event(name, new_name)
        } else {
            self.rename_brick(name, new_name)
        }
    }

    pub fn rename_event(&mut self, name: &str, new_name: &str) -> Result<()> {
        let new_name = self.fresh_name(new_name)?;
        let event = self.event_mut(name)?;
        if event.is_running() {
            return Err(CoreError::InvalidName(format!("{name} is running")));
        }
        event.name = new_name.clone();
        tracing::info!(event = %name, new_name = %new_name, "Event renamed");
        self.emit(FactoryEvent::BrickChanged(new_name));
        Ok(())
    }

    /// Rename a stopped brick. Its socks follow the new name.
    pub fn rename_brick(&mut self, name: &str, new_name: &str) -> Result<()> {
        let new_name = self.fresh_name(new_name)?;
        let id = self.brick_id(name)?;
        if self.bricks[&id].is_running() {
            return Err(CoreError::InvalidName(format!("{name} is running")));
        }
        if self.bricks[&id].is_remote() {
            self.forward(id, &format!("{name} rename {new_name}"));
        }
        let own_path = {
            let Some(brick) = self.bricks.get_mut(&id) else {
                return Ok(());
            };
            brick.name = new_name.clone();
            brick
                .kind
                .own_sock_path(&brick.name, &brick.config, &self.settings)
        };
        let old_prefix = format!("{name}_");
        let socks = self.bricks[&id].socks.clone();
        for (index, sock) in socks.into_iter().enumerate() {
            if let Some(s) = self.links.sock_mut(sock) {
                if let Some(suffix) = s.nickname.strip_prefix(&old_prefix) {
                    s.nickname = format!("{new_name}_{suffix}");
                }
                if index == 0 {
                    if let Some(path) = &own_path {
                        s.path = path.clone();
                    }
                }
            }
        }
        for image in self.images.values_mut() {
            if image.users.remove(name) {
                image.users.insert(new_name.clone());
            }
        }
        tracing::info!(brick = %name, new_name = %new_name, "Brick renamed");
        self.emit(FactoryEvent::BrickChanged(new_name));
        Ok(())
    }

    /// Stop everything and forget the topology. Remote hosts are kept.
    pub fn reset_all(&mut self) {
        let names: Vec<String> = self.bricks.values().map(|b| b.name.clone()).collect();
        for name in &names {
            if let Err(e) = self.poweroff(name) {
                tracing::warn!(brick = %name, error = %e, "Poweroff during reset failed");
            }
        }
        for event in &mut self.events {
            if let Some(timer) = event.timer.take() {
                timer.abort();
            }
        }
        self.bricks.clear();
        self.events.clear();
        self.links = LinkGraph::new();
        self.images.clear();
        self.project = ProjectParams {
            filename: self.project.filename.clone(),
            ..ProjectParams::default()
        };
        tracing::info!(bricks = names.len(), "Topology reset");
        self.emit(FactoryEvent::ImagesChanged);
    }

    // ------------------------------------------------------------------------
    // Configuration and links
    // ------------------------------------------------------------------------

    /// Apply `key=value` assignments (or event action words) to an entity.
    pub fn configure(&mut self, name: &str, words: &[String]) -> Result<()> {
        if let Ok(event) = self.event_mut(name) {
            event.configure(words)?;
            self.emit(FactoryEvent::BrickChanged(name.to_string()));
            return Ok(());
        }

        let id = self.brick_id(name)?;
        for word in words {
            let (key, raw) = parse_assignment(word)?;
            if key == "homehost" {
                self.set_homehost(id, &raw)?;
                continue;
            }
            let value = {
                let brick = self
                    .bricks
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
                brick.config.set_string(&key, &raw)?
            };
            if let Some(dev) = crate::bricks::slot_for_base_key(&key) {
                if self.bricks[&id].kind.disk_slots().contains(&dev) {
                    self.bind_disk(id, dev, &raw);
                }
            }
            self.refresh_own_sock(id);
            self.apply_live(id, &key, &value);
            if self.bricks[&id].is_remote() {
                self.forward(id, &config_command(name, &key, &raw));
            }
        }
        self.emit(FactoryEvent::BrickChanged(name.to_string()));
        Ok(())
    }

    fn set_homehost(&mut self, id: BrickId, addr: &str) -> Result<()> {
        let addr = addr.trim();
        let host = if addr.is_empty() {
            None
        } else if self.remote_hosts.contains_key(addr) {
            Some(addr.to_string())
        } else {
            return Err(CoreError::NotFound(format!("remote host {addr}")));
        };
        if let Some(brick) = self.bricks.get_mut(&id) {
            brick.homehost = host;
        }
        Ok(())
    }

    /// Hot-reconfigure a running local brick.
    fn apply_live(&mut self, id: BrickId, key: &str, value: &Value) {
        let Some(brick) = self.bricks.get_mut(&id) else {
            return;
        };
        if !brick.is_running() || brick.is_remote() {
            return;
        }
        let Some(command) = brick.kind.live_reconfigure(key, value, &brick.config) else {
            return;
        };
        let name = brick.name.clone();
        match brick.proc.as_mut() {
            Some(proc) => {
                for line in command.lines() {
                    if let Err(e) = proc.send_console(line) {
                        tracing::warn!(brick = %name, key, error = %e, "Live reconfiguration failed");
                    }
                }
                tracing::info!(brick = %name, key, "Applied to running brick");
            }
            None => tracing::debug!(brick = %name, key, "No process to reconfigure"),
        }
    }

    fn refresh_own_sock(&mut self, id: BrickId) {
        let Some(brick) = self.bricks.get(&id) else {
            return;
        };
        let Some(path) = brick
            .kind
            .own_sock_path(&brick.name, &brick.config, &self.settings)
        else {
            return;
        };
        if let Some(sock) = brick.socks.first().copied() {
            if let Some(s) = self.links.sock_mut(sock) {
                s.path = path;
            }
        }
    }

    fn bind_disk(&mut self, id: BrickId, dev: &str, image: &str) {
        let Some(brick) = self.bricks.get_mut(&id) else {
            return;
        };
        let vm = brick.name.clone();
        let bound = (!image.is_empty() && self.images.contains_key(image)).then(|| image.to_string());
        if bound.is_none() && !image.is_empty() {
            tracing::warn!(vm = %vm, dev, image, "Unknown disk image");
        }
        let _ = brick.config.set_value(dev, Value::Object(bound));

        let in_use: Vec<String> = brick
            .kind
            .disk_slots()
            .iter()
            .filter_map(|d| match brick.config.get(d) {
                Some(Value::Object(Some(name))) => Some(name.clone()),
                _ => None,
            })
            .collect();
        for (name, img) in self.images.iter_mut() {
            if in_use.contains(name) {
                img.users.insert(vm.clone());
            } else {
                img.users.remove(&vm);
            }
        }
    }

    /// Rebind every disk slot from its `base<dev>` key.
    pub fn bind_disks(&mut self, id: BrickId) {
        let Some(brick) = self.bricks.get(&id) else {
            return;
        };
        let slots: Vec<(&'static str, String)> = brick
            .kind
            .disk_slots()
            .iter()
            .filter_map(|dev| {
                crate::bricks::base_key(dev).map(|key| (*dev, brick.config.str(key).to_string()))
            })
            .collect();
        for (dev, image) in slots {
            self.bind_disk(id, dev, &image);
        }
    }

    /// Connect the first free plug of `name` to the sock `sockname`.
    ///
    /// Bricks with dynamic plugs get a new plug when none is free.
    pub fn connect_to(&mut self, name: &str, sockname: &str) -> Result<PlugId> {
        let id = self.brick_id(name)?;
        let sock = self
            .links
            .find_sock(sockname)
            .ok_or_else(|| CoreError::NotFound(format!("sock {sockname}")))?;
        let free = self.bricks[&id].plugs.iter().copied().find(|p| {
            self.links
                .plug(*p)
                .is_some_and(|p| p.sock.is_none() && p.mode == PlugMode::Vde)
        });
        let plug = match free {
            Some(plug) => plug,
            None if self.bricks[&id].kind.dynamic_plugs() => self.new_dynamic_plug(id),
            None => return Err(CoreError::not_connected(name, "no free plug")),
        };
        self.links.connect(plug, Some(sock));
        if self.bricks[&id].is_remote() {
            self.forward(id, &format!("{name} connect {sockname}"));
        }
        tracing::info!(brick = %name, sock = %sockname, "Plug connected");
        self.emit(FactoryEvent::BrickChanged(name.to_string()));
        Ok(plug)
    }

    fn new_dynamic_plug(&mut self, id: BrickId) -> PlugId {
        let plug = self.links.add_plug(id);
        if !self.bricks[&id].kind.disk_slots().is_empty() {
            if let Some(p) = self.links.plug_mut(plug) {
                p.nic = Some(Nic::new(crate::bricks::DEFAULT_NIC_MODEL, random_mac(), 0));
            }
        }
        if let Some(brick) = self.bricks.get_mut(&id) {
            brick.plugs.push(plug);
        }
        plug
    }

    /// Disconnect every plug of a brick.
    pub fn disconnect(&mut self, name: &str) -> Result<()> {
        let id = self.brick_id(name)?;
        for plug in self.bricks[&id].plugs.clone() {
            self.links.disconnect(plug);
        }
        self.emit(FactoryEvent::BrickChanged(name.to_string()));
        Ok(())
    }

    /// Add a NIC plug to a VM.
    ///
    /// `sock` is required for VDE plugs and ignored for user-mode ones.
    pub fn add_vm_plug(
        &mut self,
        name: &str,
        sock: Option<&str>,
        mode: PlugMode,
        model: &str,
        mac: &str,
    ) -> Result<PlugId> {
        let id = self.brick_id(name)?;
        if !self.bricks[&id].kind.dynamic_plugs() {
            return Err(CoreError::UnmanagedType(format!(
                "{} has a fixed set of plugs",
                name
            )));
        }
        let sock = match (mode, sock) {
            (PlugMode::Vde, Some(nick)) => Some(
                self.links
                    .find_sock(nick)
                    .ok_or_else(|| CoreError::NotFound(format!("sock {nick}")))?,
            ),
            (PlugMode::Vde, None) => return Err(CoreError::not_connected(name, "no sock given")),
            _ => None,
        };
        let plug = self.links.add_plug(id);
        self.links.connect(plug, sock);
        if let Some(p) = self.links.plug_mut(plug) {
            p.mode = mode;
            p.nic = Some(Nic::new(model, mac, 0));
        }
        if let Some(brick) = self.bricks.get_mut(&id) {
            brick.plugs.push(plug);
        }
        self.emit(FactoryEvent::BrickChanged(name.to_string()));
        Ok(plug)
    }

    /// Add a NIC sock to a VM, named `<vm>_sock_eth<n>`.
    pub fn add_vm_sock(&mut self, name: &str, model: &str, mac: &str) -> Result<SockId> {
        let id = self.brick_id(name)?;
        let index = self.bricks[&id].socks.len();
        let nickname = format!("{name}_sock_eth{index}");
        let path = self.settings.socket_dir.join(format!("{nickname}.ctl"));
        let sock = self.links.add_sock(id, &nickname, path);
        if let Some(s) = self.links.sock_mut(sock) {
            s.nic = Some(Nic::new(model, mac, 0));
        }
        if let Some(brick) = self.bricks.get_mut(&id) {
            brick.socks.push(sock);
        }
        self.emit(FactoryEvent::BrickChanged(name.to_string()));
        Ok(sock)
    }

    /// Remove the `index`th plug of a brick with dynamic plugs.
    pub fn remove_plug(&mut self, name: &str, index: usize) -> Result<()> {
        let id = self.brick_id(name)?;
        if !self.bricks[&id].kind.dynamic_plugs() {
            return Err(CoreError::UnmanagedType(format!("{name} has a fixed set of plugs")));
        }
        let plug = *self.bricks[&id]
            .plugs
            .get(index)
            .ok_or_else(|| CoreError::NotFound(format!("plug {index} of {name}")))?;
        self.links.remove_plug(plug);
        if let Some(brick) = self.bricks.get_mut(&id) {
            brick.plugs.retain(|p| *p != plug);
        }
        self.emit(FactoryEvent::BrickChanged(name.to_string()));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start a brick or an event.
    ///
    /// Bricks are checked in order: configured (`BadConfig`), every plug
    /// configured (`NotConnected`), every plug reaching a running brick
    /// (`Linkloop`, starting the peers on the way). Checks are skipped in
    /// server mode. Spawn failures are published as
    /// [`FactoryEvent::Error`] and do not fail the call.
    pub fn poweron(&mut self, name: &str) -> Result<()> {
        if self.event(name).is_some() {
            return self.start_event(name);
        }
        let id = self.brick_id(name)?;
        if self.bricks[&id].is_running() {
            return Ok(());
        }
        if !self.server_mode {
            if !self.configured(id) {
                return Err(CoreError::BadConfig(name.to_string()));
            }
            if !self.properly_connected(id) {
                return Err(CoreError::not_connected(name, "a plug has no sock"));
            }
            if let Err(e) = self.check_links(id) {
                if self.settings.erroronloop && e.is_connectivity() {
                    let _ = self.poweroff(name);
                }
                return Err(e);
            }
        }
        self.do_poweron(id)
    }

    fn check_links(&mut self, id: BrickId) -> Result<()> {
        let name = self.bricks[&id].name.clone();
        for plug in self.bricks[&id].plugs.clone() {
            if !self.plug_connected(plug)? {
                return Err(CoreError::Linkloop(name));
            }
        }
        Ok(())
    }

    /// Whether `plug` reaches a running brick whose own plugs are connected.
    ///
    /// Starts the sock owner on the way. A plug met again while its check
    /// is in progress is a loop: an error with `erroronloop`, connected
    /// otherwise.
    pub fn plug_connected(&mut self, plug: PlugId) -> Result<bool> {
        let Some(p) = self.links.plug(plug) else {
            return Ok(false);
        };
        if p.mode != PlugMode::Vde {
            return Ok(true);
        }
        if p.antiloop {
            if self.settings.erroronloop {
                let owner = self.brick_by_id(p.brick).map(|b| b.name.clone()).unwrap_or_default();
                return Err(CoreError::not_connected(owner, "network loop detected"));
            }
            tracing::debug!(plug = %plug, "Loop met while checking links");
            return Ok(true);
        }
        let Some(sock) = p.sock else {
            return Ok(false);
        };
        let Some(owner) = self.links.sock(sock).map(|s| s.brick) else {
            return Ok(false);
        };

        if let Some(p) = self.links.plug_mut(plug) {
            p.antiloop = true;
        }
        let result = self.owner_connected(owner);
        if let Some(p) = self.links.plug_mut(plug) {
            p.antiloop = false;
        }
        result
    }

    fn owner_connected(&mut self, owner: BrickId) -> Result<bool> {
        let Some(name) = self.bricks.get(&owner).map(|b| b.name.clone()) else {
            return Ok(false);
        };
        self.poweron(&name)?;
        let brick = &self.bricks[&owner];
        if !brick.is_remote() && !brick.is_running() {
            return Ok(false);
        }
        for plug in brick.plugs.clone() {
            if !self.plug_connected(plug)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn do_poweron(&mut self, id: BrickId) -> Result<()> {
        let name = self.bricks[&id].name.clone();
        if self.bricks[&id].is_running() {
            return Ok(());
        }
        if self.bricks[&id].is_remote() {
            self.forward(id, &format!("{name} on"));
            return Ok(());
        }

        self.lock_disks(id)?;
        let started = self.start_local(id);
        match started {
            Ok(()) => {
                tracing::info!(brick = %name, pid = ?self.bricks[&id].pid(), "Brick started");
                self.emit(FactoryEvent::BrickStarted(name.clone()));
                self.post_poweron(id);
            }
            Err(e) => {
                self.unlock_disks(id);
                tracing::error!(brick = %name, error = %e, "Brick failed to start");
                self.emit(FactoryEvent::Error(format!("{name}: {e}")));
            }
        }
        Ok(())
    }

    fn start_local(&mut self, id: BrickId) -> Result<()> {
        let plan = {
            let brick = &self.bricks[&id];
            let ctx = self
                .context(id)
                .ok_or_else(|| CoreError::NotFound(brick.name.clone()))?;
            brick.kind.prepare(&ctx)?;

            if brick.kind.native_bridge() {
                StartPlan::Bridge
            } else if let Some(program) = brick.kind.prog(&self.settings, &brick.config) {
                let sudo = brick.kind.needs_sudo().then(|| SudoSpec {
                    prefix: self.settings.sudo_prefix(),
                    pidfile_flag: brick.kind.pidfile_flag().to_string(),
                    pidfile: self.settings.workspace.join(format!("{}.pid", brick.name)),
                });
                let output = Some(brick.config.str("stdout"))
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from);
                StartPlan::Spawn(SpawnRequest {
                    brick: brick.name.clone(),
                    program,
                    args: brick.kind.args(&ctx),
                    sudo,
                    output,
                    console: brick.kind.console_path(&ctx),
                    console_retries: self.settings.console_retries,
                    console_backoff: self.settings.console_backoff(),
                })
            } else {
                StartPlan::Passive
            }
        };

        let (proc, task) = match plan {
            StartPlan::Spawn(request) => (Some(BrickProcess::spawn(request)?), None),
            StartPlan::Bridge => (None, Some(self.start_bridge(id)?)),
            StartPlan::Passive => (None, None),
        };
        if let Some(brick) = self.bricks.get_mut(&id) {
            brick.proc = proc;
            brick.bridge = task;
            brick.active = true;
        }
        Ok(())
    }

    fn start_bridge(&self, id: BrickId) -> Result<tokio::task::JoinHandle<()>> {
        let runtime = self
            .runtime
            .clone()
            .ok_or_else(|| CoreError::Scheduler("no runtime for in-process wire".into()))?;
        let ctx = self
            .context(id)
            .ok_or_else(|| CoreError::NotFound(format!("{id}")))?;
        let name = ctx.name.to_string();
        let first = ctx
            .plugs
            .first()
            .and_then(|p| p.sock_path.clone())
            .ok_or_else(|| CoreError::not_connected(&name, "first plug has no sock"))?;
        let second = ctx.plugs.get(1).and_then(|p| p.sock_path.clone());
        let peer: Option<SocketAddr> = format!(
            "{}:{}",
            ctx.config.str("remotehost"),
            ctx.config.int("remoteport")
        )
        .parse()
        .ok();
        let local_dir = self.settings.socket_dir.clone();
        let notifier = self.notifier.clone();

        Ok(runtime.spawn(async move {
            let opened = async {
                let a = Endpoint::Vde(VdePort::open(&first, &local_dir, &name).await?);
                let b = match second {
                    Some(path) => Endpoint::Vde(VdePort::open(&path, &local_dir, &name).await?),
                    None => Endpoint::udp(peer).await?,
                };
                Ok::<_, std::io::Error>((a, b))
            }
            .await;
            match opened {
                Ok((a, b)) => {
                    if let Some(port) = b.udp_port() {
                        let _ = notifier.send(FactoryEvent::UdpPort {
                            brick: name.clone(),
                            port,
                        });
                    }
                    bridge(name, a, b).await;
                }
                Err(e) => {
                    tracing::error!(wire = %name, error = %e, "Wire endpoints unavailable");
                    let _ = notifier.send(FactoryEvent::Error(format!("{name}: {e}")));
                }
            }
        }))
    }

    fn post_poweron(&mut self, id: BrickId) {
        let (commands, event) = {
            let brick = &self.bricks[&id];
            let commands = self
                .context(id)
                .map(|ctx| brick.kind.post_poweron(&ctx))
                .unwrap_or_default();
            (commands, brick.config.str(PON_EVENT).to_string())
        };
        let name = self.bricks[&id].name.clone();
        for command in commands {
            let mut argv = self.settings.sudo_prefix();
            argv.extend(command);
            if let Err(e) = run_host_command(&name, &argv) {
                tracing::warn!(brick = %name, error = %e, "Post start command failed");
            }
        }
        self.fire_linked_event(&name, &event);
    }

    fn fire_linked_event(&mut self, brick: &str, event: &str) {
        if event.is_empty() {
            return;
        }
        if let Err(e) = self.start_event(event) {
            tracing::warn!(brick, event, error = %e, "Linked event not started");
        }
    }

    fn lock_disks(&mut self, id: BrickId) -> Result<()> {
        let brick = &self.bricks[&id];
        let masters: Vec<String> = brick
            .kind
            .disk_slots()
            .iter()
            .filter(|dev| !crate::bricks::is_private(&brick.config, dev))
            .filter_map(|dev| match brick.config.get(dev) {
                Some(Value::Object(Some(image))) => Some(image.clone()),
                _ => None,
            })
            .collect();
        let vm = brick.name.clone();
        for (taken, image) in masters.iter().enumerate() {
            let result = match self.images.get_mut(image) {
                Some(img) => img.acquire_master(&vm),
                None => Err(CoreError::NotFound(format!("disk image {image}"))),
            };
            if let Err(e) = result {
                for image in &masters[..taken] {
                    if let Some(img) = self.images.get_mut(image) {
                        img.release_master(&vm);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn unlock_disks(&mut self, id: BrickId) {
        let Some(vm) = self.bricks.get(&id).map(|b| b.name.clone()) else {
            return;
        };
        for image in self.images.values_mut() {
            image.release_master(&vm);
        }
    }

    /// Stop a brick or an event.
    ///
    /// Remote bricks are told to stop without waiting for confirmation.
    pub fn poweroff(&mut self, name: &str) -> Result<()> {
        if self.event(name).is_some() {
            return self.stop_event(name);
        }
        let id = self.brick_id(name)?;
        if !self.bricks[&id].is_running() {
            return Ok(());
        }
        if self.bricks[&id].is_remote() {
            self.forward(id, &format!("{name} off"));
            if let Some(brick) = self.bricks.get_mut(&id) {
                brick.remote_running = false;
                brick.active = false;
            }
            self.emit(FactoryEvent::BrickStopped(name.to_string()));
            return Ok(());
        }

        let (proc, task) = match self.bricks.get_mut(&id) {
            Some(brick) => (brick.proc.take(), brick.bridge.take()),
            None => return Ok(()),
        };
        if let Some(proc) = proc {
            let pid = proc.pid();
            match proc.terminate(self.settings.stop_timeout()) {
                Ok(status) => tracing::debug!(brick = %name, pid, status = ?status, "Process reaped"),
                Err(e) => tracing::warn!(brick = %name, pid, error = %e, "Process did not stop cleanly"),
            }
        }
        if let Some(task) = task {
            task.abort();
        }
        self.finish_stop(id);
        Ok(())
    }

    /// Common bookkeeping once a local brick has no process anymore.
    fn finish_stop(&mut self, id: BrickId) {
        self.unlock_disks(id);
        let Some(name) = self.bricks.get_mut(&id).map(|b| {
            b.active = false;
            b.name.clone()
        }) else {
            return;
        };
        if let (Some(brick), Some(ctx)) = (self.bricks.get(&id), self.context(id)) {
            brick.kind.post_poweroff(&ctx);
        }
        tracing::info!(brick = %name, "Brick stopped");
        self.emit(FactoryEvent::BrickStopped(name.clone()));
        let event = self.bricks[&id].config.str(POFF_EVENT).to_string();
        self.fire_linked_event(&name, &event);
    }

    /// Notice processes and wires that ended on their own.
    ///
    /// Their disk locks are released and `poff_vbevent` fires, as on a
    /// regular stop. Returns the names of the bricks reaped.
    pub fn reap(&mut self) -> Vec<String> {
        let mut gone = Vec::new();
        for (id, brick) in self.bricks.iter_mut() {
            let exited = match brick.proc.as_mut() {
                Some(proc) => proc.try_wait().map(|status| status.to_string()),
                None => None,
            };
            let bridge_done = brick.bridge.as_ref().is_some_and(|t| t.is_finished());
            if let Some(status) = exited {
                tracing::warn!(brick = %brick.name, %status, "Brick process exited");
                brick.proc = None;
                gone.push(*id);
            } else if bridge_done {
                tracing::warn!(brick = %brick.name, "Wire bridge ended");
                brick.bridge = None;
                gone.push(*id);
            }
        }
        let mut names = Vec::new();
        for id in gone {
            names.push(self.bricks[&id].name.clone());
            self.finish_stop(id);
        }
        names
    }

    /// Stop every brick and event.
    pub fn poweroff_all(&mut self) {
        let names: Vec<String> = self
            .bricks
            .values()
            .filter(|b| b.is_running())
            .map(|b| b.name.clone())
            .chain(self.events.iter().filter(|e| e.is_running()).map(|e| e.name.clone()))
            .collect();
        for name in names {
            if let Err(e) = self.poweroff(&name) {
                tracing::warn!(name = %name, error = %e, "Poweroff failed");
            }
        }
    }

    /// Send a management command to a running brick's console.
    pub fn send_console(&mut self, name: &str, command: &str) -> Result<()> {
        let id = self.brick_id(name)?;
        let brick = self
            .bricks
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        match brick.proc.as_mut() {
            Some(proc) => proc.send_console(command),
            None => Err(CoreError::NotFound(format!("running process of {name}"))),
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Arm an event's timer. It fires every `delay` seconds until stopped.
    pub fn start_event(&mut self, name: &str) -> Result<()> {
        let runtime = self.runtime.clone();
        let engine = self.engine.clone();
        let event = self.event_mut(name)?;
        if event.is_running() {
            return Ok(());
        }
        if !event.configured() {
            return Err(CoreError::BadConfig(name.to_string()));
        }
        let runtime =
            runtime.ok_or_else(|| CoreError::Scheduler("no runtime for event timers".into()))?;
        let delay = Duration::from_secs(event.delay().max(0) as u64);
        let task_name = name.to_string();
        event.timer = Some(runtime.spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(engine) = Engine::upgrade(&engine) else {
                    break;
                };
                let fired = task_name.clone();
                match engine.run(move |f| f.fire_event(&fired)).await {
                    Ok(true) => {}
                    _ => break,
                }
            }
        }));
        tracing::info!(event = %name, delay_secs = delay.as_secs(), "Event started");
        self.emit(FactoryEvent::EventStarted(name.to_string()));
        Ok(())
    }

    /// Cancel an event's timer.
    pub fn stop_event(&mut self, name: &str) -> Result<()> {
        let event = self.event_mut(name)?;
        let Some(timer) = event.timer.take() else {
            return Ok(());
        };
        timer.abort();
        tracing::info!(event = %name, "Event stopped");
        self.emit(FactoryEvent::EventStopped(name.to_string()));
        Ok(())
    }

    /// Run an event's actions now. Returns whether it should stay armed.
    pub fn fire_event(&mut self, name: &str) -> bool {
        let Some(actions) = self.event(name).map(|e| e.actions.clone()) else {
            return false;
        };
        tracing::info!(event = %name, actions = actions.len(), "Event fired");
        for action in &actions {
            match action {
                Action::VbShell(cmd) => {
                    let mut out = Vec::new();
                    let outcome = crate::console::parse(self, cmd, &mut out);
                    tracing::debug!(event = %name, cmd = %cmd, ?outcome, "Event action run");
                }
                Action::HostShell(cmd) => spawn_host_action(name, cmd),
            }
        }
        self.emit(FactoryEvent::EventAccomplished(name.to_string()));
        self.event(name).is_some_and(Event::is_running)
    }

    // ------------------------------------------------------------------------
    // Disk images
    // ------------------------------------------------------------------------

    pub fn add_image(&mut self, name: &str, path: &str, host: Option<&str>) -> Result<()> {
        let name = Self::valid_name(name)?;
        if self.images.contains_key(&name) {
            return Err(CoreError::InvalidName(format!("image {name} already exists")));
        }
        let mut image = DiskImage::new(name.clone(), path);
        image.host = host.map(str::to_string);
        self.images.insert(name.clone(), image);
        tracing::info!(image = %name, path, "Disk image registered");
        self.emit(FactoryEvent::ImagesChanged);
        Ok(())
    }

    pub fn del_image(&mut self, name: &str) -> Result<()> {
        let image = self
            .images
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("disk image {name}")))?;
        if image.in_use() {
            return Err(CoreError::invalid_value(
                name,
                format!("used by {}", image.users.iter().cloned().collect::<Vec<_>>().join(", ")),
            ));
        }
        self.images.remove(name);
        self.emit(FactoryEvent::ImagesChanged);
        Ok(())
    }

    pub fn set_image_readonly(&mut self, name: &str, readonly: bool) -> Result<()> {
        let image = self
            .images
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("disk image {name}")))?;
        image.readonly = readonly;
        self.emit(FactoryEvent::ImagesChanged);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Remote hosts
    // ------------------------------------------------------------------------

    /// Get or register a remote host.
    pub fn remote_host_entry(&mut self, addr: &str) -> &mut RemoteHost {
        if !self.remote_hosts.contains_key(addr) {
            tracing::info!(host = %addr, "Remote host registered");
            let _ = self.notifier.send(FactoryEvent::RemoteHostsChanged);
        }
        self.remote_hosts
            .entry(addr.to_string())
            .or_insert_with(|| RemoteHost::new(addr))
    }

    fn send_to_host(&self, addr: &str, line: &str) -> bool {
        self.remote_hosts
            .get(addr)
            .is_some_and(|host| host.send(line))
    }

    fn forward(&self, id: BrickId, line: &str) -> bool {
        match self.bricks.get(&id).and_then(|b| b.homehost.as_deref()) {
            Some(host) => self.send_to_host(host, line),
            None => false,
        }
    }

    /// Install the outgoing half of a fresh connection.
    pub fn set_remote_link(&mut self, addr: &str, link: RemoteLink) {
        self.remote_host_entry(addr).link = Some(link);
        self.emit(FactoryEvent::RemoteHostsChanged);
    }

    /// Bricks hosted on `addr`, in creation order.
    pub fn hosted_bricks(&self, addr: &str) -> Vec<String> {
        self.bricks
            .values()
            .filter(|b| b.homehost.as_deref() == Some(addr))
            .map(|b| b.name.clone())
            .collect()
    }

    /// Commands re-creating a hosted brick on its peer.
    ///
    /// Only non-object values are sent. Values containing a newline cannot
    /// travel on the line protocol and are skipped.
    pub fn upload_commands(&self, name: &str) -> Vec<String> {
        let Some(brick) = self.brick(name) else {
            return Vec::new();
        };
        let mut lines = vec![format!("new {} {}", brick.type_name(), brick.name)];
        for (key, value) in brick.config.string_pairs() {
            if value.contains('\n') {
                tracing::warn!(brick = %name, key = %key, "Value with newline not uploaded");
                continue;
            }
            lines.push(config_command(&brick.name, &key, &value));
        }
        for plug in &brick.plugs {
            let sock = self
                .links
                .plug(*plug)
                .and_then(|p| p.sock)
                .and_then(|s| self.links.sock(s));
            if let Some(sock) = sock {
                lines.push(format!("{} connect {}", brick.name, sock.nickname));
            }
        }
        lines
    }

    /// A peer reported one of its bricks as started.
    pub fn remote_brick_started(&mut self, name: &str) {
        if let Some(id) = self.find_brick(name) {
            if let Some(brick) = self.bricks.get_mut(&id) {
                brick.remote_running = true;
            }
            self.emit(FactoryEvent::BrickStarted(name.to_string()));
        }
    }

    /// A peer reported one of its bricks as stopped.
    pub fn remote_brick_stopped(&mut self, name: &str) {
        if let Some(id) = self.find_brick(name) {
            if let Some(brick) = self.bricks.get_mut(&id) {
                brick.remote_running = false;
            }
            self.emit(FactoryEvent::BrickStopped(name.to_string()));
        }
    }

    /// A wire on a peer listens for UDP on `port`.
    pub fn remote_udp_port(&mut self, addr: &str, brick: &str, port: u16) {
        if let Some(host) = self.remote_hosts.get_mut(addr) {
            host.udp_ports.insert(brick.to_string(), port);
        }
        tracing::info!(host = %addr, brick, port, "Remote wire UDP port");
    }

    /// Connection to a peer was lost: its bricks are marked stopped.
    pub fn remote_disconnected(&mut self, addr: &str) {
        if let Some(host) = self.remote_hosts.get_mut(addr) {
            host.link = None;
        }
        for name in self.hosted_bricks(addr) {
            if self.brick(&name).is_some_and(|b| b.remote_running) {
                self.remote_brick_stopped(&name);
            }
        }
        tracing::warn!(host = %addr, "Remote host disconnected");
        self.emit(FactoryEvent::RemoteHostsChanged);
    }
}

/// `<name> config <key>=<value>` with the value quoted for the console.
fn config_command(name: &str, key: &str, value: &str) -> String {
    if value.is_empty() {
        format!("{name} config {key}=")
    } else {
        format!("{name} config {key}={}", crate::console::quote(value))
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Shared handle to a [`Factory`] behind a single lock.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Mutex<Factory>>,
}

impl Engine {
    /// Create an engine. Must be called within a tokio runtime for event
    /// timers and in-process wires to work.
    pub fn new(settings: Settings) -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let mut factory = Factory::new(settings);
            factory.engine = weak.clone();
            Mutex::new(factory)
        });
        Self { inner }
    }

    fn upgrade(weak: &Weak<Mutex<Factory>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Lock the factory. A poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, Factory> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the factory from the blocking pool.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Factory) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut factory = inner.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut factory)
        })
        .await
        .map_err(|e| CoreError::Scheduler(e.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FactoryEvent> {
        self.lock().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> (tempfile::TempDir, Factory) {
        let dir = tempfile::tempdir().unwrap();
        let factory = Factory::new(Settings::rooted_at(dir.path()));
        (dir, factory)
    }

    #[test]
    fn test_valid_name() {
        assert_eq!(Factory::valid_name("My Brick").unwrap(), "My_Brick");
        assert_eq!(Factory::valid_name("  sw-1.a ").unwrap(), "sw-1.a");
        assert!(matches!(Factory::valid_name("1abc"), Err(CoreError::InvalidName(_))));
        assert!(Factory::valid_name("").is_err());
        assert!(Factory::valid_name("a/b").is_err());
    }

    #[test]
    fn test_names_unique_across_bricks_and_events() {
        let (_dir, mut f) = factory();
        f.newbrick("switch", "sw1", None).unwrap();
        assert!(matches!(f.newbrick("wire", "sw1", None), Err(CoreError::InvalidName(_))));
        assert!(matches!(f.newevent("sw1"), Err(CoreError::InvalidName(_))));
        f.newevent("ev1").unwrap();
        assert!(f.newbrick("tap", "ev1", None).is_err());
        assert!(matches!(
            f.newbrick("toaster", "t1", None),
            Err(CoreError::UnmanagedType(_))
        ));
    }

    #[test]
    fn test_switch_owns_port_sock() {
        let (dir, mut f) = factory();
        let id = f.newbrick("Switch", "sw1", None).unwrap();
        let sock = f.links.find_sock("sw1_port").unwrap();
        assert_eq!(f.links.sock(sock).unwrap().brick, id);
        assert_eq!(
            f.links.sock(sock).unwrap().path,
            dir.path().join("run").join("sw1.ctl")
        );
        assert!(f.configured(id));
    }

    #[test]
    fn test_unconfigured_fails_before_link_checks() {
        let (_dir, mut f) = factory();
        f.newbrick("wire", "w1", None).unwrap();
        assert!(matches!(f.poweron("w1"), Err(CoreError::BadConfig(_))));

        f.newbrick("capture", "cap", None).unwrap();
        f.newbrick("switch", "sw1", None).unwrap();
        f.connect_to("cap", "sw1_port").unwrap();
        assert!(matches!(f.poweron("cap"), Err(CoreError::BadConfig(_))));
    }

    #[test]
    fn test_cascade_delete_disconnects_plugs() {
        let (_dir, mut f) = factory();
        f.newbrick("switch", "sw1", None).unwrap();
        let wire = f.newbrick("wire", "w1", None).unwrap();
        let plug = f.connect_to("w1", "sw1_port").unwrap();
        f.newbrick("vm", "vm1", None).unwrap();
        let nic = f.connect_to("vm1", "sw1_port").unwrap();

        f.delbrick("sw1").unwrap();
        assert!(f.links.plug(plug).unwrap().sock.is_none());
        assert_eq!(f.brick_by_id(wire).unwrap().plugs.len(), 2);
        assert!(f.links.plug(nic).is_none());
        assert!(f.brick("vm1").unwrap().plugs.is_empty());
        assert!(f.links.find_sock("sw1_port").is_none());
    }

    #[test]
    fn test_connect_needs_free_plug() {
        let (_dir, mut f) = factory();
        f.newbrick("switch", "sw1", None).unwrap();
        f.newbrick("tap", "tap0", None).unwrap();
        f.connect_to("tap0", "sw1_port").unwrap();
        assert!(matches!(
            f.connect_to("tap0", "sw1_port"),
            Err(CoreError::NotConnected { .. })
        ));
        assert!(matches!(f.connect_to("tap0", "nope"), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_dupbrick_copies_values_and_links() {
        let (_dir, mut f) = factory();
        f.newbrick("switch", "sw1", None).unwrap();
        f.newbrick("wirefilter", "wf", None).unwrap();
        f.configure("wf", &["delay=20".to_string()]).unwrap();
        f.connect_to("wf", "sw1_port").unwrap();

        assert_eq!(f.dupbrick("wf").unwrap(), "Copy_of_wf");
        assert_eq!(f.dupbrick("wf").unwrap(), "Copy_of_wf_new");
        let copy = f.brick("Copy_of_wf").unwrap();
        assert_eq!(copy.config.str("delay"), "20");
        let first = f.links.plug(copy.plugs[0]).unwrap();
        assert_eq!(first.sock, f.links.find_sock("sw1_port"));
    }

    #[test]
    fn test_dup_vm_gets_fresh_identity() {
        let (_dir, mut f) = factory();
        f.newbrick("switch", "sw1", None).unwrap();
        f.newbrick("qemu", "vm1", None).unwrap();
        f.connect_to("vm1", "sw1_port").unwrap();
        let copy = f.dupbrick("vm1").unwrap();

        let nic = |name: &str| {
            let b = f.brick(name).unwrap();
            f.links.plug(b.plugs[0]).unwrap().nic.clone().unwrap()
        };
        assert_ne!(nic("vm1").mac, nic(&copy).mac);
        assert_ne!(
            f.brick("vm1").unwrap().config.str("uuid"),
            f.brick(&copy).unwrap().config.str("uuid")
        );
    }

    #[test]
    fn test_rename_follows_socks() {
        let (dir, mut f) = factory();
        f.newbrick("switch", "sw1", None).unwrap();
        f.newbrick("wire", "w1", None).unwrap();
        let plug = f.connect_to("w1", "sw1_port").unwrap();

        f.rename("sw1", "core").unwrap();
        let sock = f.links.find_sock("core_port").unwrap();
        assert_eq!(f.links.plug(plug).unwrap().sock, Some(sock));
        assert_eq!(f.links.sock(sock).unwrap().path, dir.path().join("run").join("core.ctl"));
        assert!(matches!(f.rename("core", "w1"), Err(CoreError::InvalidName(_))));
    }

    #[test]
    fn test_disk_binding_and_locks() {
        let (_dir, mut f) = factory();
        f.add_image("debian", "/images/debian.img", None).unwrap();
        let vm1 = f.newbrick("qemu", "vm1", None).unwrap();
        let vm2 = f.newbrick("qemu", "vm2", None).unwrap();
        f.configure("vm1", &["basehda=debian".to_string()]).unwrap();
        f.configure("vm2", &["basehda=debian".to_string()]).unwrap();
        assert!(f.images["debian"].users.contains("vm1"));
        assert!(matches!(f.del_image("debian"), Err(CoreError::InvalidValue { .. })));

        f.lock_disks(vm1).unwrap();
        assert!(matches!(f.lock_disks(vm2), Err(CoreError::DiskLocked { .. })));
        f.unlock_disks(vm1);
        f.lock_disks(vm2).unwrap();
        f.unlock_disks(vm2);

        f.set_image_readonly("debian", true).unwrap();
        assert!(matches!(f.lock_disks(vm1), Err(CoreError::LockedImage(_))));
        f.configure("vm1", &["privatehda=True".to_string()]).unwrap();
        f.lock_disks(vm1).unwrap();
    }

    #[test]
    fn test_live_reconfigure_only_when_running() {
        let (_dir, mut f) = factory();
        f.newbrick("switch", "sw1", None).unwrap();
        f.configure("sw1", &["numports=8".to_string()]).unwrap();
        assert_eq!(f.brick("sw1").unwrap().config.int("numports"), 8);
        assert!(f.configure("sw1", &["numports=500".to_string()]).is_err());
    }

    #[test]
    fn test_remote_brick_forwarding() {
        let (_dir, mut f) = factory();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        f.remote_host_entry("10.0.0.2");
        f.set_remote_link("10.0.0.2", RemoteLink::new(tx));

        f.newbrick("switch", "rsw", Some("10.0.0.2")).unwrap();
        f.configure("rsw", &["numports=4".to_string()]).unwrap();
        f.poweron("rsw").unwrap();
        assert!(!f.brick("rsw").unwrap().is_running());
        f.remote_brick_started("rsw");
        assert!(f.brick("rsw").unwrap().is_running());
        f.remote_disconnected("10.0.0.2");
        assert!(!f.brick("rsw").unwrap().is_running());

        let mut sent = Vec::new();
        while let Ok(line) = rx.try_recv() {
            sent.push(line);
        }
        assert_eq!(sent, vec!["new Switch rsw", "rsw config numports=4", "rsw on"]);
        assert_eq!(
            f.upload_commands("rsw"),
            vec![
                "new Switch rsw",
                "rsw config fstp=False",
                "rsw config group=",
                "rsw config hub=False",
                "rsw config macaddr=",
                "rsw config mode=",
                "rsw config numports=4",
                "rsw config poff_vbevent=",
                "rsw config pon_vbevent=",
            ]
        );
    }

    #[test]
    fn test_uploaded_values_keep_whitespace() {
        let (_dir, mut f) = factory();
        f.newbrick("qemu", "vm1", None).unwrap();
        f.configure("vm1", &["kopt=ro quiet".to_string()]).unwrap();
        let lines = f.upload_commands("vm1");
        assert!(lines.contains(&"vm1 config kopt=\"ro quiet\"".to_string()));

        let (_peer_dir, mut peer) = factory();
        for line in &lines {
            let mut sink = Vec::new();
            let outcome = crate::console::parse(&mut peer, line, &mut sink);
            assert_eq!(outcome, crate::console::Outcome::Ok, "{line}");
        }
        assert_eq!(peer.brick("vm1").unwrap().config.str("kopt"), "ro quiet");
        assert_eq!(
            peer.brick("vm1").unwrap().config.str("uuid"),
            f.brick("vm1").unwrap().config.str("uuid")
        );
    }
}
