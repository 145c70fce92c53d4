//! Integration tests for voicectl
//!
//! These run the compiled binary against temporary configuration files.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;
use voice_orchestrator::OrchestratorConfig;

const SAMPLE: &str = r#"
[selection]
strategy = "balanced"

[[providers]]
id = "whisper-local"
kind = "stt"
deployment_mode = "docker"
priority = 1

[[providers]]
id = "deepgram"
kind = "stt"
deployment_mode = "cloud"
priority = 2
estimated_latency_ms = 250

[[providers]]
id = "piper"
kind = "tts"
deployment_mode = "system"
priority = 1

[fallback_chains]
stt = ["deepgram", "whisper-local"]
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

fn voicectl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_voicectl"))
        .args(args)
        .env_remove("VOICECTL_CONFIG")
        .output()
        .expect("run voicectl")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// ============================================================================
// validate
// ============================================================================

#[test]
fn validate_accepts_sample_configuration() {
    let file = config_file(SAMPLE);
    let output = voicectl(&["validate", "--config", file.path().to_str().unwrap()]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("3 provider(s)"), "{text}");
    assert!(text.contains("stt chain: deepgram → whisper-local"), "{text}");
}

#[test]
fn validate_rejects_chain_with_unknown_provider() {
    let file = config_file(
        r#"
        [[providers]]
        id = "piper"
        kind = "tts"
        deployment_mode = "system"

        [fallback_chains]
        tts = ["piper", "elevenlabs"]
        "#,
    );
    let output = voicectl(&["validate", "--config", file.path().to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("elevenlabs"), "{}", stderr(&output));
}

#[test]
fn validate_rejects_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let output = voicectl(&["validate", "--config", path.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("not found"));
}

// ============================================================================
// defaults
// ============================================================================

#[test]
fn defaults_print_a_loadable_configuration() {
    let output = voicectl(&["defaults"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let parsed: OrchestratorConfig = toml::from_str(&stdout(&output)).expect("valid TOML");
    assert_eq!(parsed, OrchestratorConfig::default());
}

// ============================================================================
// plan
// ============================================================================

#[test]
fn plan_ranks_chain_by_priority() {
    let file = config_file(SAMPLE);
    let output = voicectl(&["plan", "stt", "--config", file.path().to_str().unwrap()]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("1. whisper-local (priority 1, docker, stt)"), "{text}");
    assert!(text.contains("2. deepgram (priority 2, cloud, stt)"), "{text}");
}

#[test]
fn plan_honours_preferred_provider() {
    let file = config_file(SAMPLE);
    let output = voicectl(&[
        "plan",
        "stt",
        "--provider",
        "deepgram",
        "--config",
        file.path().to_str().unwrap(),
    ]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("1. deepgram"), "{}", stdout(&output));
}

#[test]
fn plan_prints_json() {
    let file = config_file(SAMPLE);
    let output = voicectl(&[
        "plan",
        "tts",
        "--json",
        "--config",
        file.path().to_str().unwrap(),
    ]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let plan: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(plan["operation"], "tts");
    assert_eq!(plan["candidates"][0]["provider_id"], "piper");
    assert_eq!(plan["degraded"], false);
}

#[test]
fn plan_without_providers_fails() {
    let file = config_file("");
    let output = voicectl(&["plan", "tts", "--config", file.path().to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("No eligible provider"), "{}", stderr(&output));
}
