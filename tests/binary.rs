//! Integration tests for the `server`/`client` binaries, driven entirely
//! over TCP loopback with a memory-backed chain — no kernel NBD device,
//! no root, nothing outside this process tree.

use std::env;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Output};
use std::thread::sleep;
use std::time::Duration;

use color_eyre::Result;
use serial_test::serial;

fn exe_path(name: &str) -> PathBuf {
    let bin_dir = env::current_exe()
        .unwrap()
        .parent()
        .expect("test executable's directory")
        .parent()
        .expect("output directory")
        .to_path_buf();
    bin_dir.join(name)
}

fn cmd_stdout(out: Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

/// Grab a likely-free TCP port by binding to port 0 and releasing it.
/// There's a small race before `server` rebinds it, acceptable for tests.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("binding ephemeral port")
        .local_addr()
        .unwrap()
        .port()
}

struct Server {
    child: Child,
    port: u16,
}

impl Server {
    fn start(extra_args: &[&str]) -> Self {
        let port = free_port();
        let child = Command::new(exe_path("server"))
            .args(["--host", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .args(extra_args)
            .spawn()
            .expect("failed to start server");
        sleep(Duration::from_millis(200));
        Server { child, port }
    }

    fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn client(server: &Server, args: &[&str]) -> Output {
    Command::new(exe_path("client"))
        .args(["--host", &server.host()])
        .args(args)
        .output()
        .expect("failed to run client")
}

#[test]
fn test_client_help_flag() {
    let out = Command::new(exe_path("client"))
        .arg("--help")
        .output()
        .expect("failed to run client --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("client"));
}

#[test]
fn test_server_help_flag() {
    let out = Command::new(exe_path("server"))
        .arg("--help")
        .output()
        .expect("failed to run server --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("server"));
}

#[test]
#[serial]
fn test_read_starts_zeroed() -> Result<()> {
    let server = Server::start(&["--plugin", "memory:1M"]);
    let out = client(&server, &["read", "0", "16"]);
    assert!(out.status.success(), "client read failed: {out:?}");
    assert_eq!(cmd_stdout(out).trim(), "00".repeat(16));
    Ok(())
}

#[test]
#[serial]
fn test_write_then_read_round_trips() -> Result<()> {
    let server = Server::start(&["--plugin", "memory:1M"]);

    let out = client(&server, &["write", "1024", "deadbeef"]);
    assert!(out.status.success(), "client write failed: {out:?}");

    let out = client(&server, &["read", "1024", "4"]);
    assert!(out.status.success(), "client read failed: {out:?}");
    assert_eq!(cmd_stdout(out).trim(), "deadbeef");
    Ok(())
}

#[test]
#[serial]
fn test_flush_succeeds() -> Result<()> {
    let server = Server::start(&["--plugin", "memory:1M"]);
    let out = client(&server, &["flush"]);
    assert!(out.status.success(), "client flush failed: {out:?}");
    Ok(())
}

#[test]
#[serial]
fn test_readonly_filter_rejects_writes() -> Result<()> {
    let server = Server::start(&["--filter", "readonly", "--plugin", "memory:1M"]);
    let out = client(&server, &["write", "0", "aa"]);
    assert!(
        !out.status.success(),
        "write through a readonly chain should fail"
    );
    Ok(())
}

#[test]
#[serial]
fn test_concurrent_connections_see_the_same_backing_store() -> Result<()> {
    let server = Server::start(&["--plugin", "memory:1M"]);

    let out = client(&server, &["write", "0", "cafef00d"]);
    assert!(out.status.success(), "first connection's write failed");

    // A second, independent connection to the same memory export should
    // see the first connection's write (one shared plugin instance).
    let out = client(&server, &["read", "0", "4"]);
    assert!(out.status.success(), "second connection's read failed");
    assert_eq!(cmd_stdout(out).trim(), "cafef00d");
    Ok(())
}

#[test]
#[serial]
fn test_map_filter_remaps_reads() -> Result<()> {
    // Everything in [0,99] maps to dest 1000, so a write at 1000 should
    // show up when reading through the filter at offset 0.
    let server = Server::start(&["--filter", "map:0-99=1000", "--plugin", "memory:4096"]);

    let out = client(&server, &["write", "1000", "11223344"]);
    assert!(out.status.success(), "write failed: {out:?}");

    let out = client(&server, &["read", "0", "4"]);
    assert!(out.status.success(), "read failed: {out:?}");
    assert_eq!(cmd_stdout(out).trim(), "11223344");
    Ok(())
}

#[test]
#[serial]
fn test_size_subcommand_reports_export_size() -> Result<()> {
    let server = Server::start(&["--plugin", "memory:65536"]);
    let out = client(&server, &["size"]);
    assert!(out.status.success(), "client size failed: {out:?}");
    assert_eq!(cmd_stdout(out).trim(), "65536");
    Ok(())
}
