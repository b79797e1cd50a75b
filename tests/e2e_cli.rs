//! CLI end-to-end tests
//!
//! Tests for the postmux command-line interface.

mod common;

use assert_cmd::prelude::*;
use common::Workspace;
use predicates::prelude::*;
use std::process::Command;

/// Get a command for the postmux binary, running inside `ws` so no config
/// file from the working directory is picked up.
#[allow(deprecated)]
fn postmux_cmd(ws: &Workspace) -> Command {
    let mut cmd = Command::cargo_bin("postmux").unwrap();
    cmd.current_dir(ws.dir.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_no_args_shows_help() {
    let ws = Workspace::new();
    postmux_cmd(&ws)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_help_flag() {
    let ws = Workspace::new();
    postmux_cmd(&ws)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("postmux"))
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_version_flag() {
    let ws = Workspace::new();
    postmux_cmd(&ws)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("postmux"));
}

#[test]
fn test_cli_lists_algorithms() {
    let ws = Workspace::new();
    let mut assert = postmux_cmd(&ws).arg("algorithms").assert().success();
    for name in ["webm", "mp4D-mp4", "mp4D-m4a", "ttml", "webm-ogg-d"] {
        assert = assert.stdout(predicate::str::contains(name));
    }
}

#[test]
fn test_cli_validate_defaults() {
    let ws = Workspace::new();
    postmux_cmd(&ws)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("using defaults"))
        .stdout(predicate::str::contains("Stall limit: 16"));
}

#[test]
fn test_cli_validate_config_file() {
    let ws = Workspace::new();
    let config = ws.write(
        "postmux.toml",
        b"[postprocessing]\nstall_limit = 4\nhold_policy = \"retry\"\n\n[mp4]\nchunk_ms = 500\n",
    );
    postmux_cmd(&ws)
        .arg("validate")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Stall limit: 4"))
        .stdout(predicate::str::contains("MP4 chunk: 500 ms"));
}

#[test]
fn test_cli_validate_rejects_invalid_config() {
    let ws = Workspace::new();
    let config = ws.write("bad.toml", b"[postprocessing]\nstall_limit = 0\n");
    postmux_cmd(&ws)
        .args(["--config"])
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("stall_limit"));
}

#[test]
fn test_cli_run_ttml_to_srt() {
    let ws = Workspace::new();
    let input = ws.write("captions.ttml", common::TTML.as_bytes());
    let output = ws.path("captions.srt");

    postmux_cmd(&ws)
        .arg("run")
        .arg("ttml")
        .arg(&output)
        .arg("--source")
        .arg(&input)
        .args(["--arg", "ttml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));

    assert_eq!(String::from_utf8(common::read(&output)).unwrap(), common::TTML_AS_SRT);
}

#[test]
fn test_cli_run_same_file_ogg() {
    let ws = Workspace::new();
    let path = ws.write("audio.webm", &common::opus_webm(60));

    postmux_cmd(&ws)
        .arg("run")
        .arg("webm-ogg-d")
        .arg(&path)
        .arg("--same-file")
        .assert()
        .success();
    assert_eq!(&common::read(&path)[..4], b"OggS");

    // Second run finds nothing to do
    postmux_cmd(&ws)
        .arg("run")
        .arg("webm-ogg-d")
        .arg(&path)
        .arg("--same-file")
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to do"));
}

#[test]
fn test_cli_run_unknown_algorithm_reports_code() {
    let ws = Workspace::new();
    let input = ws.write("in.bin", b"data");

    postmux_cmd(&ws)
        .arg("run")
        .arg("flac")
        .arg(ws.path("out.flac"))
        .arg("-s")
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("POSTPROCESSING (1007)"));
}

#[test]
fn test_cli_run_requires_sources() {
    let ws = Workspace::new();
    postmux_cmd(&ws)
        .arg("run")
        .arg("webm")
        .arg(ws.path("out.webm"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("--source"));
}

#[test]
fn test_cli_probe_webm_json() {
    let ws = Workspace::new();
    let path = ws.write("audio.webm", &common::opus_webm(25));

    postmux_cmd(&ws)
        .arg("probe")
        .arg(&path)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"codec\": \"A_OPUS\""))
        .stdout(predicate::str::contains("\"samples\": 25"));
}

#[test]
fn test_cli_probe_dash_mp4() {
    let ws = Workspace::new();
    let path = ws.write("video.mp4", &common::dash_video(30));

    postmux_cmd(&ws)
        .arg("probe")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("mp4 (dash)"))
        .stdout(predicate::str::contains("avc1"))
        .stdout(predicate::str::contains("640x360"));
}

#[test]
fn test_cli_probe_missing_file() {
    let ws = Workspace::new();
    postmux_cmd(&ws)
        .arg("probe")
        .arg(ws.path("missing.webm"))
        .assert()
        .failure();
}
