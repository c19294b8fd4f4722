//! Project save/restore round trips.

use std::collections::BTreeSet;
use vbricks_core::{configfile, Factory, PlugMode, Settings};

fn factory(dir: &tempfile::TempDir) -> Factory {
    Factory::new(Settings::rooted_at(dir.path()))
}

/// `(type, name)` of every brick and event.
fn entities(f: &Factory) -> BTreeSet<(String, String)> {
    f.bricks()
        .map(|b| (b.type_name().to_string(), b.name.clone()))
        .chain(f.events().map(|e| ("Event".to_string(), e.name.clone())))
        .collect()
}

/// `(brick, plug index, sock nickname or mode)` for every plug.
fn topology(f: &Factory) -> BTreeSet<(String, usize, String)> {
    let mut links = BTreeSet::new();
    for brick in f.bricks() {
        for (i, plug) in brick.plugs.iter().filter_map(|p| f.links.plug(*p)).enumerate() {
            let target = match plug.mode {
                PlugMode::Vde => plug
                    .sock
                    .and_then(|s| f.links.sock(s))
                    .map(|s| s.nickname.clone())
                    .unwrap_or_default(),
                PlugMode::User => "user".into(),
                PlugMode::HostOnly => "hostonly".into(),
            };
            links.insert((brick.name.clone(), i, target));
        }
    }
    links
}

#[test]
fn test_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut f = factory(&dir);

    f.remote_host_entry("10.0.0.2").password = "pw".into();
    f.add_image("debian", "/srv/debian.img", None).unwrap();
    f.set_image_readonly("debian", true).unwrap();

    f.newbrick("switch", "sw1", None).unwrap();
    f.newbrick("switch", "sw2", None).unwrap();
    f.configure("sw2", &["numports=64".to_string(), "hub=True".to_string()]).unwrap();
    f.newbrick("wire", "w1", None).unwrap();
    f.connect_to("w1", "sw1_port").unwrap();
    f.connect_to("w1", "sw2_port").unwrap();
    f.newbrick("wirefilter", "wf1", None).unwrap();
    f.configure("wf1", &["delay=20".to_string(), "delayJ=5".to_string()]).unwrap();
    f.connect_to("wf1", "sw2_port").unwrap();

    f.newbrick("qemu", "vm1", None).unwrap();
    f.configure("vm1", &["basehda=debian".to_string(), "privatehda=True".to_string(), "ram=512".to_string()])
        .unwrap();
    f.add_vm_plug("vm1", Some("sw1_port"), PlugMode::Vde, "e1000", "00:aa:00:00:00:01")
        .unwrap();
    f.add_vm_plug("vm1", None, PlugMode::User, "rtl8139", "00:aa:00:00:00:02")
        .unwrap();
    f.add_vm_plug("vm1", None, PlugMode::HostOnly, "rtl8139", "00:aa:00:00:00:03")
        .unwrap();
    f.add_vm_sock("vm1", "virtio", "00:aa:00:00:00:04").unwrap();
    f.newbrick("qemu", "vm2", None).unwrap();
    f.add_vm_plug("vm2", Some("vm1_sock_eth0"), PlugMode::Vde, "virtio", "00:aa:00:00:00:05")
        .unwrap();

    f.newbrick("switch", "rsw", Some("10.0.0.2")).unwrap();
    f.newevent("ev1").unwrap();
    f.configure("ev1", &["delay=3".to_string()]).unwrap();
    f.configure("ev1", &["addsh".to_string(), "echo".to_string(), "it's".to_string()]).unwrap();

    let path = dir.path().join("lab.vbl");
    configfile::save(&mut f, &path).unwrap();

    let mut g = factory(&dir);
    configfile::restore(&mut g, &path).unwrap();

    assert_eq!(entities(&f), entities(&g));
    assert_eq!(topology(&f), topology(&g));
    assert_eq!(g.project.id, f.project.id);

    assert!(g.images["debian"].readonly);
    assert!(g.images["debian"].users.contains("vm1"));
    assert_eq!(g.remote_hosts["10.0.0.2"].password, "pw");
    assert_eq!(g.brick("rsw").unwrap().homehost.as_deref(), Some("10.0.0.2"));
    assert_eq!(g.brick("sw2").unwrap().config.int("numports"), 64);
    assert_eq!(g.brick("wf1").unwrap().config.str("delayJ"), "5");
    assert_eq!(
        g.brick("vm1").unwrap().config.str("uuid"),
        f.brick("vm1").unwrap().config.str("uuid")
    );
    assert_eq!(g.event("ev1").unwrap().actions, f.event("ev1").unwrap().actions);

    let vm1 = g.brick("vm1").unwrap();
    let nic = g.links.plug(vm1.plugs[0]).unwrap().nic.clone().unwrap();
    assert_eq!((nic.model.as_str(), nic.mac.as_str()), ("e1000", "00:aa:00:00:00:01"));

    // Saving the restored project reproduces the same text.
    assert_eq!(configfile::to_text(&f), configfile::to_text(&g));
}

#[test]
fn test_dangling_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut f = factory(&dir);
    let text = "\
[Project:lab]
id=9

[Switch:sw1]

[DiskImage:broken]
readonly=False

[Toaster:t1]
heat=9

[Wire:w1]

link|w1|sw1_port
link|ghost|sw1_port
link|w1|nowhere
bogus line

[Switch:sw2]
";
    configfile::restore_text(&mut f, text).unwrap();
    assert!(f.brick("t1").is_none());
    assert!(f.images.is_empty());
    assert!(f.brick("sw2").is_some());
    let w1 = f.brick("w1").unwrap();
    let plug = f.links.plug(w1.plugs[0]).unwrap();
    assert_eq!(plug.sock, f.links.find_sock("sw1_port"));
    assert!(f.links.plug(w1.plugs[1]).unwrap().sock.is_none());
}
