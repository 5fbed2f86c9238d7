// SPDX-License-Identifier: Apache-2.0

//! Binary-level CLI argument parsing tests for both `pixelgrade-server` and
//! `pixelgrade-client`, run as subprocesses against the compiled binaries.

use std::process::Command;

fn server_help() -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_pixelgrade-server"))
        .arg("--help")
        .output()
        .expect("Failed to execute pixelgrade-server");
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn client_help() -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_pixelgrade-client"))
        .arg("--help")
        .output()
        .expect("Failed to execute pixelgrade-client");
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn server_help_lists_expected_options() {
    let help = server_help();
    assert!(help.contains("--config"), "server --help should mention --config");
    assert!(help.contains("--daemon"), "server --help should mention --daemon");
    assert!(help.contains("--foreground"), "server --help should mention --foreground");
    assert!(help.contains("--pidfile"), "server --help should mention --pidfile");
}

#[test]
fn server_rejects_daemon_and_foreground_together() {
    let output = Command::new(env!("CARGO_BIN_EXE_pixelgrade-server"))
        .args(["--daemon", "--foreground"])
        .output()
        .expect("Failed to execute pixelgrade-server");
    assert!(!output.status.success(), "--daemon and --foreground should conflict");
}

#[test]
fn client_help_lists_expected_options() {
    let help = client_help();
    assert!(help.contains("--processing"), "client --help should mention --processing");
    assert!(help.contains("--host"), "client --help should mention --host");
    assert!(help.contains("--port"), "client --help should mention --port");
    assert!(help.contains("--protocol"), "client --help should mention --protocol");
    assert!(help.contains("--chunk-size"), "client --help should mention --chunk-size");
}

#[test]
fn client_requires_at_least_one_file() {
    let output = Command::new(env!("CARGO_BIN_EXE_pixelgrade-client"))
        .output()
        .expect("Failed to execute pixelgrade-client");
    assert!(!output.status.success(), "client should fail with no files given");
}

#[test]
fn client_rejects_unknown_processing_value() {
    let output = Command::new(env!("CARGO_BIN_EXE_pixelgrade-client"))
        .args(["--processing", "bogus", "cat.png"])
        .output()
        .expect("Failed to execute pixelgrade-client");
    assert!(!output.status.success(), "client should reject an unknown --processing value");
}

#[test]
fn client_fails_cleanly_when_server_unreachable() {
    // Port 1 is reserved and nothing will be listening there; the client
    // should report a connection failure rather than hang or panic.
    let output = Command::new(env!("CARGO_BIN_EXE_pixelgrade-client"))
        .args(["--host", "127.0.0.1", "--port", "1"])
        .arg(env!("CARGO_MANIFEST_DIR").to_string() + "/Cargo.toml")
        .output()
        .expect("Failed to execute pixelgrade-client");
    assert!(!output.status.success(), "client should exit non-zero when the server is unreachable");
}
