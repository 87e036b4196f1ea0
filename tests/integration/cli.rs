//! End-to-end test of the `orchestra` binary: a real `serve` process is
//! spawned against a temporary config and driven with the `start`/
//! `status`/`stop` subcommands over the network, mirroring how an operator
//! would actually use the CLI.
use std::io::Write;
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin;
use predicates::prelude::*;
use tempfile::tempdir;

const TEST_PORT: u16 = 28199;

struct ServeGuard(Child);

impl Drop for ServeGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn wait_for_port(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        if Instant::now() > deadline {
            panic!("orchestra serve did not open port {port} within the deadline");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

// A single test drives one spawned `serve` process through every scenario:
// the Desired-State Store binds a fixed port with no test-time override, so
// two `serve` instances running concurrently in this binary would race on
// it.
#[test]
fn start_status_stop_round_trip_against_a_live_binary() {
    let home = tempdir().unwrap();
    let config_path = home.path().join("systemg.yaml");
    let mut config_file = std::fs::File::create(&config_path).unwrap();
    writeln!(
        config_file,
        "services:\n  web:\n    command: \"sleep 30\"\n    restart_policy: never\n"
    )
    .unwrap();

    let child = Command::new(cargo_bin("orchestra"))
        .arg("serve")
        .arg("--config")
        .arg(&config_path)
        .env("HOME", home.path())
        .env("PC_PORT_NUM", TEST_PORT.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn orchestra serve");
    let _guard = ServeGuard(child);

    wait_for_port(TEST_PORT);
    let addr = format!("http://127.0.0.1:{TEST_PORT}");

    assert_cmd::Command::new(cargo_bin("orchestra"))
        .args(["--supervisor-addr", &addr, "start", "ghost"])
        .assert()
        .failure();

    assert_cmd::Command::new(cargo_bin("orchestra"))
        .args(["--supervisor-addr", &addr, "start", "web"])
        .assert()
        .success();

    assert_cmd::Command::new(cargo_bin("orchestra"))
        .args(["--supervisor-addr", &addr, "status", "web", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"web\""))
        .stdout(predicate::str::contains("\"is_running\": true"));

    assert_cmd::Command::new(cargo_bin("orchestra"))
        .args(["--supervisor-addr", &addr, "stop", "web"])
        .assert()
        .success();

    assert_cmd::Command::new(cargo_bin("orchestra"))
        .args(["--supervisor-addr", &addr, "status", "web", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"is_running\": false"));
}
