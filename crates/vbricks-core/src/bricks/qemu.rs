//! QEMU virtual machines.
//!
//! A VM has up to seven disk slots bound to [`DiskImage`]s, any number of
//! NIC plugs and socks, and a monitor socket used as its internal console.
//!
//! Each slot `<dev>` is described by three keys:
//!
//! - `base<dev>`: name of the bound disk image
//! - `private<dev>`: run on a copy-on-write overlay instead of the image
//! - `<dev>`: the binding itself (an object reference, never persisted)
//!
//! [`DiskImage`]: crate::image::DiskImage

use super::{ArgSource, BrickType, BuildContext};
use crate::config::{Config, Parameter, Value};
use crate::error::{CoreError, Result};
use crate::link::PlugMode;
use crate::settings::Settings;
use rand::Rng;
use std::path::PathBuf;
use std::process::Command;

/// Disk slots in command line order.
pub const DISK_SLOTS: &[&str] = &["hda", "hdb", "hdc", "hdd", "fda", "fdb", "mtdblock"];

const BASE_KEYS: &[&str] = &[
    "basehda",
    "basehdb",
    "basehdc",
    "basehdd",
    "basefda",
    "basefdb",
    "basemtdblock",
];

const PRIVATE_KEYS: &[&str] = &[
    "privatehda",
    "privatehdb",
    "privatehdc",
    "privatehdd",
    "privatefda",
    "privatefdb",
    "privatemtdblock",
];

/// Default NIC model for new VM plugs and socks.
pub const DEFAULT_NIC_MODEL: &str = "rtl8139";

/// Random locally administered MAC in the `00:aa` range.
pub fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    let tail: [u8; 4] = rng.gen();
    format!(
        "00:aa:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3]
    )
}

/// Overlay file of a private disk slot.
pub fn cow_path(settings: &Settings, vm: &str, dev: &str) -> PathBuf {
    settings.workspace.join(format!("{vm}_{dev}.cow"))
}

/// Image path `dev` resolves to, if the slot is bound.
fn disk_path(ctx: &BuildContext<'_>, slot: usize) -> Option<PathBuf> {
    let dev = DISK_SLOTS[slot];
    let image = match ctx.config.get(dev) {
        Some(Value::Object(Some(name))) => ctx.images.get(name)?,
        _ => return None,
    };
    if ctx.config.bool(PRIVATE_KEYS[slot]) {
        Some(cow_path(ctx.settings, ctx.name, dev))
    } else {
        Some(image.path.clone())
    }
}

/// `qemu-system-<argv0>`.
#[derive(Debug, Clone, Copy)]
pub struct Qemu;

impl BrickType for Qemu {
    fn type_name(&self) -> &'static str {
        "Qemu"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        let mut schema = vec![
            ("argv0", Parameter::Str("x86_64")),
            ("uuid", Parameter::Str("")),
            (
                "ram",
                Parameter::SpinInt {
                    default: 64,
                    min: 8,
                    max: 262_144,
                },
            ),
            (
                "smp",
                Parameter::SpinInt {
                    default: 1,
                    min: 1,
                    max: 64,
                },
            ),
            ("kvm", Parameter::Boolean(false)),
            ("cdrom", Parameter::Str("")),
            ("boot", Parameter::Str("")),
            ("kernel", Parameter::Str("")),
            ("initrd", Parameter::Str("")),
            ("kopt", Parameter::Str("")),
            ("nographic", Parameter::Boolean(false)),
            ("vnc", Parameter::Boolean(false)),
            (
                "vncN",
                Parameter::SpinInt {
                    default: 1,
                    min: 0,
                    max: 500,
                },
            ),
            ("keyboard", Parameter::Str("")),
            ("usbmode", Parameter::Boolean(false)),
            ("stdout", Parameter::Str("")),
        ];
        for slot in 0..DISK_SLOTS.len() {
            schema.push((BASE_KEYS[slot], Parameter::Str("")));
            schema.push((PRIVATE_KEYS[slot], Parameter::Boolean(false)));
            schema.push((DISK_SLOTS[slot], Parameter::Object));
        }
        schema
    }

    fn prog(&self, settings: &Settings, config: &Config) -> Option<PathBuf> {
        Some(settings.qemu_tool(&format!("qemu-system-{}", config.str("argv0"))))
    }

    fn command_builder(&self) -> Vec<(&'static str, ArgSource)> {
        vec![
            ("-name", ArgSource::Call(|ctx| Some(ctx.name.to_string()))),
            ("-uuid", ArgSource::Key("uuid")),
            ("-m", ArgSource::Key("ram")),
            ("-smp", ArgSource::Key("smp")),
            ("-enable-kvm", ArgSource::Key("kvm")),
            ("-cdrom", ArgSource::Key("cdrom")),
            ("-boot", ArgSource::Key("boot")),
            ("-kernel", ArgSource::Key("kernel")),
            ("-initrd", ArgSource::Key("initrd")),
            ("-append", ArgSource::Key("kopt")),
            ("-nographic", ArgSource::Key("nographic")),
            (
                "-vnc",
                ArgSource::Call(|ctx| {
                    ctx.config
                        .bool("vnc")
                        .then(|| format!(":{}", ctx.config.int("vncN")))
                }),
            ),
            ("-k", ArgSource::Key("keyboard")),
            ("-usb", ArgSource::Key("usbmode")),
            ("#stdout", ArgSource::Key("stdout")),
        ]
    }

    fn args(&self, ctx: &BuildContext<'_>) -> Vec<String> {
        let mut args = super::build_args(self, ctx);

        for slot in 0..DISK_SLOTS.len() {
            if let Some(path) = disk_path(ctx, slot) {
                args.push(format!("-{}", DISK_SLOTS[slot]));
                args.push(path.display().to_string());
            }
        }

        let mut nics = 0;
        for plug in &ctx.plugs {
            let backend = match plug.mode {
                PlugMode::Vde => match &plug.sock_path {
                    Some(path) => format!("vde,sock={}", path.display()),
                    None => continue,
                },
                PlugMode::User => "user".to_string(),
                PlugMode::HostOnly => "user,restrict=on".to_string(),
            };
            push_nic(&mut args, nics, &backend, plug.nic.as_ref());
            nics += 1;
        }
        for sock in &ctx.socks {
            let backend = format!("vde,sock={}", sock.path.display());
            push_nic(&mut args, nics, &backend, sock.nic.as_ref());
            nics += 1;
        }
        if nics == 0 {
            args.push("-nic".into());
            args.push("none".into());
        }

        let monitor = ctx.run_file(".mgmt");
        let user_monitor = ctx.run_file("_cons.mgmt");
        for (id, path) in [("mon", &monitor), ("mon_cons", &user_monitor)] {
            args.push("-chardev".into());
            args.push(format!(
                "socket,id={id},path={},server=on,wait=off",
                path.display()
            ));
            args.push("-mon".into());
            args.push(format!("chardev={id},mode=readline"));
        }
        args
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.plugs
            .iter()
            .all(|p| p.mode != PlugMode::Vde || p.sock_path.is_some())
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        let disks: Vec<String> = (0..DISK_SLOTS.len())
            .filter_map(|slot| {
                let base = ctx.config.str(BASE_KEYS[slot]);
                (!base.is_empty()).then(|| format!("{}={base}", DISK_SLOTS[slot]))
            })
            .collect();
        format!(
            "Ram: {}M, Disks: [{}], NICs: {}",
            ctx.config.int("ram"),
            disks.join(", "),
            ctx.plugs.len() + ctx.socks.len()
        )
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn init_config(&self, config: &mut Config) {
        let _ = config.set_value("uuid", Value::Str(uuid::Uuid::new_v4().to_string()));
    }

    fn dynamic_plugs(&self) -> bool {
        true
    }

    fn pidfile_flag(&self) -> &'static str {
        "-pidfile"
    }

    fn console_path(&self, ctx: &BuildContext<'_>) -> Option<PathBuf> {
        Some(ctx.run_file(".mgmt"))
    }

    fn live_reconfigure(&self, key: &str, value: &Value, _config: &Config) -> Option<String> {
        match key {
            "cdrom" if value.as_str().is_empty() => Some("eject ide1-cd0".into()),
            "cdrom" => Some(format!("change ide1-cd0 {}", value.as_str())),
            _ => None,
        }
    }

    fn disk_slots(&self) -> &'static [&'static str] {
        DISK_SLOTS
    }

    /// Create missing copy-on-write overlays for private slots.
    fn prepare(&self, ctx: &BuildContext<'_>) -> Result<()> {
        for slot in 0..DISK_SLOTS.len() {
            if !ctx.config.bool(PRIVATE_KEYS[slot]) {
                continue;
            }
            let Some(Value::Object(Some(image))) = ctx.config.get(DISK_SLOTS[slot]) else {
                continue;
            };
            let Some(image) = ctx.images.get(image) else {
                continue;
            };
            let cow = cow_path(ctx.settings, ctx.name, DISK_SLOTS[slot]);
            if cow.exists() {
                continue;
            }
            std::fs::create_dir_all(&ctx.settings.workspace)?;
            let program = ctx.settings.qemu_tool("qemu-img");
            tracing::info!(vm = %ctx.name, cow = %cow.display(), base = %image.path.display(), "Creating disk overlay");
            let status = Command::new(&program)
                .arg("create")
                .arg("-b")
                .arg(&image.path)
                .arg("-f")
                .arg(&ctx.settings.cowfmt)
                .arg(&cow)
                .status()
                .map_err(|source| CoreError::Spawn {
                    program: program.display().to_string(),
                    source,
                })?;
            if !status.success() {
                return Err(CoreError::BadConfig(format!(
                    "{}: qemu-img exited with {status} creating {}",
                    ctx.name,
                    cow.display()
                )));
            }
        }
        Ok(())
    }
}

fn push_nic(args: &mut Vec<String>, index: usize, backend: &str, nic: Option<&crate::link::Nic>) {
    args.push("-netdev".into());
    args.push(format!("{backend},id=eth{index}"));
    let (model, mac) = nic
        .map(|n| (n.model.as_str(), n.mac.as_str()))
        .unwrap_or((DEFAULT_NIC_MODEL, ""));
    let mut device = format!("{model},netdev=eth{index}");
    if !mac.is_empty() {
        device.push_str(&format!(",mac={mac}"));
    }
    args.push("-device".into());
    args.push(device);
}

/// Image-name key of a disk slot.
pub fn base_key(dev: &str) -> Option<&'static str> {
    DISK_SLOTS
        .iter()
        .position(|d| *d == dev)
        .map(|slot| BASE_KEYS[slot])
}

/// Disk slot an image-name key refers to.
pub fn slot_for_base_key(key: &str) -> Option<&'static str> {
    BASE_KEYS
        .iter()
        .position(|k| *k == key)
        .map(|slot| DISK_SLOTS[slot])
}

/// Private flag of a disk slot.
pub fn is_private(config: &Config, dev: &str) -> bool {
    DISK_SLOTS
        .iter()
        .position(|d| *d == dev)
        .map(|slot| config.bool(PRIVATE_KEYS[slot]))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::context;
    use super::super::PlugView;
    use super::*;
    use crate::image::DiskImage;
    use crate::link::Nic;
    use std::collections::BTreeMap;

    #[test]
    fn test_random_mac_format() {
        let mac = random_mac();
        assert!(mac.starts_with("00:aa:"));
        assert_eq!(mac.len(), 17);
        assert_ne!(random_mac(), random_mac());
    }

    #[test]
    fn test_vm_args() {
        let settings = Settings::default();
        let mut config = Config::new(&Qemu.schema());
        Qemu.init_config(&mut config);
        config.set("kvm=True").unwrap();
        config.set("basehda=debian").unwrap();
        config
            .set_value("hda", Value::Object(Some("debian".into())))
            .unwrap();
        let mut images = BTreeMap::new();
        images.insert("debian".to_string(), DiskImage::new("debian", "/images/debian.img"));

        let mut ctx = context("vm1", &config, &settings, &images, &[]);
        ctx.plugs.push(PlugView {
            mode: PlugMode::Vde,
            nic: Some(Nic::new("e1000", "00:aa:00:00:00:01", 0)),
            sock_path: Some(PathBuf::from("/tmp/sw1.ctl")),
            sock_name: Some("sw1_port".into()),
        });
        ctx.plugs.push(PlugView {
            mode: PlugMode::User,
            nic: None,
            sock_path: None,
            sock_name: None,
        });

        assert_eq!(
            Qemu.prog(&settings, &config),
            Some(PathBuf::from("/usr/bin/qemu-system-x86_64"))
        );
        let args = Qemu.args(&ctx);
        assert!(args.contains(&"-enable-kvm".to_string()));
        assert!(args.windows(2).any(|w| w == ["-hda", "/images/debian.img"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-netdev", "vde,sock=/tmp/sw1.ctl,id=eth0"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-device", "e1000,netdev=eth0,mac=00:aa:00:00:00:01"]));
        assert!(args.windows(2).any(|w| w == ["-netdev", "user,id=eth1"]));
        assert!(!args.contains(&"none".to_string()));
        assert_eq!(config.str("uuid").len(), 36);
    }

    #[test]
    fn test_private_disk_uses_overlay() {
        let settings = Settings::default();
        let mut config = Config::new(&Qemu.schema());
        config.set("privatehdb=True").unwrap();
        config
            .set_value("hdb", Value::Object(Some("debian".into())))
            .unwrap();
        let mut images = BTreeMap::new();
        images.insert("debian".to_string(), DiskImage::new("debian", "/images/debian.img"));
        let ctx = context("vm1", &config, &settings, &images, &[]);

        let args = Qemu.args(&ctx);
        let cow = cow_path(&settings, "vm1", "hdb").display().to_string();
        assert!(args.windows(2).any(|w| w[0] == "-hdb" && w[1] == cow));
        assert!(args.windows(2).any(|w| w == ["-nic", "none"]));
    }

    #[test]
    fn test_cdrom_live_change() {
        let config = Config::new(&Qemu.schema());
        assert_eq!(
            Qemu.live_reconfigure("cdrom", &Value::Str("/iso/a.iso".into()), &config),
            Some("change ide1-cd0 /iso/a.iso".into())
        );
        assert_eq!(Qemu.live_reconfigure("ram", &Value::Int(128), &config), None);
    }

    #[test]
    fn test_slot_keys() {
        assert_eq!(base_key("fdb"), Some("basefdb"));
        assert_eq!(slot_for_base_key("basemtdblock"), Some("mtdblock"));
        assert_eq!(slot_for_base_key("ram"), None);
    }
}
