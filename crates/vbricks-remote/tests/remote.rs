//! Handshake and command loop over real sockets.

use sha2::{Digest, Sha256};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use vbricks_core::{Engine, Settings};
use vbricks_remote::handshake::{self, CHALLENGE_LEN, DIGEST_LEN, HELO};
use vbricks_remote::{client, RemoteError, RemoteServer};

/// Write an executable that sleeps until killed.
fn fake_tool(dir: &Path, name: &str) {
    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let path = bin.join(name);
    std::fs::write(&path, "#!/bin/sh\nexec sleep 300\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Start a server engine on an ephemeral port.
async fn server(dir: &Path, password: &str) -> (Engine, u16) {
    fake_tool(dir, "vde_switch");
    let engine = Engine::new(Settings::rooted_at(dir));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(RemoteServer::new(engine.clone(), password).serve(listener));
    (engine, port)
}

async fn login(port: u16, password: &str) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut stream = BufReader::new(stream);
    handshake::login(&mut stream, password, "127.0.0.1").await.unwrap();
    stream
}

async fn command(stream: &mut BufReader<TcpStream>, line: &str) -> String {
    stream.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    read_line(stream).await
}

async fn read_line(stream: &mut BufReader<TcpStream>) -> String {
    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_line(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply.trim_end().to_string()
}

#[tokio::test]
async fn test_digest_over_captured_challenge() {
    let (server_side, client_side) = tokio::io::duplex(1024);
    let server = tokio::spawn(async move {
        let mut stream = BufReader::new(server_side);
        handshake::accept(&mut stream, "s3cret", "peer").await
    });

    let mut stream = BufReader::new(client_side);
    let mut greeting = [0u8; 4];
    stream.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting, HELO);
    let mut challenge = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut challenge).await.unwrap();

    let mut hasher = Sha256::new();
    hasher.update(b"s3cret");
    hasher.update(challenge);
    let expected: [u8; DIGEST_LEN] = hasher.finalize().into();
    assert_eq!(handshake::digest("s3cret", &challenge), expected);

    stream.write_all(&expected).await.unwrap();
    let mut reply = String::new();
    stream.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "OK\n");
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_password_is_refused() {
    let (server_side, client_side) = tokio::io::duplex(1024);
    let server = tokio::spawn(async move {
        let mut stream = BufReader::new(server_side);
        handshake::accept(&mut stream, "right", "peer").await
    });

    let mut stream = BufReader::new(client_side);
    let result = handshake::login(&mut stream, "wrong", "srv").await;
    assert!(matches!(result, Err(RemoteError::AuthFailed(_))));
    assert!(matches!(server.await.unwrap(), Err(RemoteError::AuthFailed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_runs_console_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, port) = server(dir.path(), "pw").await;
    let mut stream = login(port, "pw").await;

    assert_eq!(command(&mut stream, "new switch sw1").await, "OK");
    assert_eq!(command(&mut stream, "sw1 config numports=4").await, "OK");
    assert_eq!(command(&mut stream, "sw1 config numports=banana").await, "FAIL");
    assert_eq!(command(&mut stream, "nosuch on").await, "FAIL");
    assert_eq!(engine.lock().brick("sw1").unwrap().config.int("numports"), 4);

    // Starting the switch is answered and pushed, in either order.
    stream.write_all(b"sw1 on\n").await.unwrap();
    let mut lines = vec![read_line(&mut stream).await, read_line(&mut stream).await];
    lines.sort();
    assert_eq!(lines, vec!["OK".to_string(), "brick-started sw1".to_string()]);

    engine.lock().poweroff_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_drops_unauthenticated_client() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, port) = server(dir.path(), "pw").await;

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut stream = BufReader::new(stream);
    let result = handshake::login(&mut stream, "nope", "127.0.0.1").await;
    assert!(matches!(result, Err(RemoteError::AuthFailed(_))));

    // The server is free again and nothing was executed.
    let mut stream = login(port, "pw").await;
    assert_eq!(command(&mut stream, "list").await, "OK");
    assert_eq!(engine.lock().bricks().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_uploads_and_follows_remote_bricks() {
    let server_dir = tempfile::tempdir().unwrap();
    let (server_engine, port) = server(server_dir.path(), "pw").await;

    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Settings::rooted_at(dir.path()));
    engine
        .run(move |f| {
            let host = f.remote_host_entry("127.0.0.1");
            host.password = "pw".into();
            host.port = port;
            f.newbrick("switch", "rsw", Some("127.0.0.1"))?;
            f.configure("rsw", &["numports=8".to_string()])?;
            f.newbrick("qemu", "rvm", Some("127.0.0.1"))?;
            f.configure("rvm", &["kopt=ro quiet".to_string()])
        })
        .await
        .unwrap()
        .unwrap();

    client::connect(&engine, "127.0.0.1").await.unwrap();
    assert!(engine.lock().remote_hosts["127.0.0.1"].connected());
    assert_eq!(server_engine.lock().brick("rsw").unwrap().config.int("numports"), 8);
    assert_eq!(server_engine.lock().brick("rvm").unwrap().config.str("kopt"), "ro quiet");

    // Values set after connecting are forwarded with their spaces intact.
    engine
        .run(|f| f.configure("rvm", &["kopt=console=ttyS0 quiet".to_string()]))
        .await
        .unwrap()
        .unwrap();
    let mut forwarded = String::new();
    for _ in 0..50 {
        forwarded = server_engine.lock().brick("rvm").unwrap().config.str("kopt").to_string();
        if forwarded != "ro quiet" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(forwarded, "console=ttyS0 quiet");

    engine.run(|f| f.poweron("rsw")).await.unwrap().unwrap();
    let mut running = false;
    for _ in 0..50 {
        running = engine.lock().brick("rsw").unwrap().is_running();
        if running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(running, "push should mark the remote brick running");

    client::disconnect(&engine, "127.0.0.1").await.unwrap();
    assert!(!engine.lock().brick("rsw").unwrap().is_running());
    assert!(!engine.lock().remote_hosts["127.0.0.1"].connected());

    server_engine.lock().poweroff_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_rejected_with_wrong_password() {
    let server_dir = tempfile::tempdir().unwrap();
    let (_server_engine, port) = server(server_dir.path(), "pw").await;

    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Settings::rooted_at(dir.path()));
    engine
        .run(move |f| {
            let host = f.remote_host_entry("127.0.0.1");
            host.password = "guess".into();
            host.port = port;
        })
        .await
        .unwrap();

    let result = client::connect(&engine, "127.0.0.1").await;
    assert!(matches!(result, Err(RemoteError::AuthFailed(_))));
    assert!(matches!(
        client::connect(&engine, "10.9.9.9.invalid").await,
        Err(RemoteError::UnknownHost(_))
    ));
}
