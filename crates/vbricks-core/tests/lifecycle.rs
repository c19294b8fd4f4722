//! Lifecycle tests against fake VDE tools.
//!
//! The tools are tiny shell scripts written into a scratch `vdepath`, so
//! real subprocesses are started and stopped without VDE installed.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use vbricks_core::{CoreError, Engine, Factory, FactoryEvent, Settings};

/// Write an executable that sleeps until killed.
fn fake_tool(dir: &Path, name: &str) {
    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let path = bin.join(name);
    std::fs::write(&path, "#!/bin/sh\nexec sleep 300\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn lab() -> (tempfile::TempDir, Factory) {
    let dir = tempfile::tempdir().unwrap();
    fake_tool(dir.path(), "vde_switch");
    fake_tool(dir.path(), "dpipe");
    let factory = Factory::new(Settings::rooted_at(dir.path()));
    (dir, factory)
}

/// Switch, wire, switch: starting the wire starts both switches.
#[test]
fn test_wire_between_two_switches() {
    let (_dir, mut f) = lab();
    f.newbrick("switch", "sw1", None).unwrap();
    let w1 = f.newbrick("wire", "w1", None).unwrap();
    f.connect_to("w1", "sw1_port").unwrap();
    f.newbrick("switch", "sw2", None).unwrap();
    f.connect_to("w1", "sw2_port").unwrap();
    assert!(f.properly_connected(w1));

    f.poweron("w1").unwrap();
    for name in ["sw1", "sw2", "w1"] {
        let brick = f.brick(name).unwrap();
        assert!(brick.is_running(), "{name} should run");
        assert!(brick.pid().is_some());
    }

    f.delbrick("sw1").unwrap();
    assert!(f.brick("sw1").is_none());
    assert!(!f.properly_connected(w1));

    f.poweroff_all();
    assert!(f.bricks().all(|b| !b.is_running()));
}

#[test]
fn test_precondition_order() {
    let (_dir, mut f) = lab();
    f.newbrick("wire", "w1", None).unwrap();
    assert!(matches!(f.poweron("w1"), Err(CoreError::BadConfig(_))));

    // Deleting the switch drops the VM's on-demand NIC with it.
    f.newbrick("switch", "sw1", None).unwrap();
    f.newbrick("qemu", "vm1", None).unwrap();
    f.connect_to("vm1", "sw1_port").unwrap();
    f.delbrick("sw1").unwrap();
    assert!(f.brick("vm1").unwrap().plugs.is_empty());
}

#[test]
fn test_spawn_failure_is_reported_not_returned() {
    let (dir, mut f) = lab();
    std::fs::remove_file(dir.path().join("bin").join("vde_switch")).unwrap();
    let mut events = f.subscribe();

    f.newbrick("switch", "sw1", None).unwrap();
    f.poweron("sw1").unwrap();
    assert!(!f.brick("sw1").unwrap().is_running());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let FactoryEvent::Error(message) = event {
            assert!(message.starts_with("sw1:"));
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[test]
fn test_peer_that_cannot_start_fails_link_check() {
    let (dir, mut f) = lab();
    f.newbrick("switch", "sw1", None).unwrap();
    f.newbrick("wire", "w1", None).unwrap();
    f.newbrick("switch", "sw2", None).unwrap();
    f.connect_to("w1", "sw1_port").unwrap();
    f.connect_to("w1", "sw2_port").unwrap();
    std::fs::remove_file(dir.path().join("bin").join("vde_switch")).unwrap();

    assert!(matches!(f.poweron("w1"), Err(CoreError::Linkloop(_))));
    assert!(!f.brick("w1").unwrap().is_running());
}

#[test]
fn test_reap_notices_exit() {
    let (dir, mut f) = lab();
    let path = dir.path().join("bin").join("vde_switch");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    f.newbrick("switch", "sw1", None).unwrap();
    f.poweron("sw1").unwrap();

    let mut reaped = Vec::new();
    for _ in 0..50 {
        reaped = f.reap();
        if !reaped.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(reaped, vec!["sw1".to_string()]);
    assert!(!f.brick("sw1").unwrap().is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_fires_console_actions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Settings::rooted_at(dir.path()));
    let mut events = engine.subscribe();

    engine
        .run(|f| {
            f.newevent("ev1")?;
            f.configure("ev1", &["add".to_string(), "new".to_string(), "switch".to_string(), "evsw".to_string()])?;
            f.configure("ev1", &["delay=1".to_string()])?;
            f.poweron("ev1")
        })
        .await
        .unwrap()
        .unwrap();

    let accomplished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(FactoryEvent::EventAccomplished(name)) => break name,
                Ok(_) => continue,
                Err(e) => panic!("notification channel failed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(accomplished, "ev1");

    let (created, running) = engine
        .run(|f| {
            let created = f.brick("evsw").is_some();
            f.poweroff("ev1").unwrap();
            (created, f.event("ev1").unwrap().is_running())
        })
        .await
        .unwrap();
    assert!(created);
    assert!(!running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pon_event_armed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    fake_tool(dir.path(), "vde_switch");
    let engine = Engine::new(Settings::rooted_at(dir.path()));

    let armed = engine
        .run(|f| {
            f.newevent("ev1")?;
            f.configure("ev1", &["delay=60".to_string(), "actions=['addsh true']".to_string()])?;
            f.newbrick("switch", "sw1", None)?;
            f.configure("sw1", &["pon_vbevent=ev1".to_string()])?;
            f.poweron("sw1")?;
            let armed = f.event("ev1").is_some_and(|e| e.is_running());
            f.poweroff_all();
            Ok::<_, CoreError>(armed)
        })
        .await
        .unwrap()
        .unwrap();
    assert!(armed);
}
