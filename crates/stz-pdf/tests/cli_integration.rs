//! Integration tests for the `stz-pdf` CLI binary.
//!
//! These tests invoke the compiled binary directly via
//! `std::process::Command`. Scenarios that would need the worker process
//! stop at the precondition gate, so any existing file satisfies the
//! harness's worker lookup.

use std::fs;
use std::process::Command;

fn stz_bin() -> &'static str {
    env!("CARGO_BIN_EXE_stz-pdf")
}

#[test]
fn unattested_source_is_refused_with_audit_trail() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("hmac.key"), [0x42u8; 32]).expect("write key");
    fs::write(dir.path().join("input.pdf"), b"%PDF-1.4\n%stub\n").expect("write input");

    let out = Command::new(stz_bin())
        .current_dir(dir.path())
        .env("STZ_PDF_WORKER", stz_bin())
        .args(["sanitize", "input.pdf", "--json"])
        .output()
        .expect("failed to run stz-pdf");
    assert!(!out.status.success(), "unattested job must fail the run");
    let stdout = String::from_utf8_lossy(&out.stdout);
    let json: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("stdout is not valid JSON");
    assert_eq!(json.get("status").and_then(|s| s.as_str()), Some("REJECTED"));
    assert_eq!(json.get("taxon").and_then(|t| t.as_str()), Some("SOURCE_NOT_READONLY"));

    let audit_entries = fs::read_dir(dir.path().join("audit"))
        .expect("audit dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
        .count();
    assert_eq!(audit_entries, 1, "the rejected job is audited");
}

#[test]
fn config_without_public_key_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("engine.toml");
    fs::write(&config, "policy = \"AGGRESSIVE\"\n").expect("write config");

    let out = Command::new(stz_bin())
        .args([
            "--config",
            config.to_str().expect("utf8 path"),
            "sanitize",
            "whatever.pdf",
        ])
        .output()
        .expect("failed to run stz-pdf");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("--config-pub"), "stderr: {stderr}");
}

#[test]
fn tampered_config_signature_refuses_to_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("engine.toml");
    fs::write(&config, "policy = \"AGGRESSIVE\"\n").expect("write config");
    fs::write(dir.path().join("engine.toml.sig"), b"garbage signature").expect("write sig");
    let pubkey = dir.path().join("config.pub");
    fs::write(&pubkey, [0u8; 65]).expect("write pubkey");

    let out = Command::new(stz_bin())
        .args([
            "--config",
            config.to_str().expect("utf8 path"),
            "--config-pub",
            pubkey.to_str().expect("utf8 path"),
            "sanitize",
            "whatever.pdf",
        ])
        .output()
        .expect("failed to run stz-pdf");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("signature"), "stderr: {stderr}");
}
