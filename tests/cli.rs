use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const FIXTURE: &str = r#"{
    "bills": {
        "2022-03-10": {
            "items": [
                {"product_code": "ecs", "product_name": "ECS", "subscription_type": "PostPaid", "currency": "CNY", "pretax_amount": "30.00"}
            ]
        },
        "2022-03-09": {
            "items": [
                {"product_code": "ecs", "product_name": "ECS", "subscription_type": "PostPaid", "currency": "CNY", "pretax_amount": "20.00"}
            ]
        }
    },
    "metrics": {
        "2022-03-10": {
            "cpu_utilization": [
                {"instance_id": "i-1", "average": 40.0},
                {"instance_id": "i-2", "average": 60.0}
            ]
        }
    },
    "regions": [{"region_id": "cn-hangzhou", "region_name": "Hangzhou"}],
    "instances": [
        {"provider": "AlibabaCloud", "instance_id": "i-1", "region_id": "cn-hangzhou", "subscription_type": "PrePaid"}
    ]
}"#;

fn home_path(home: &TempDir) -> &Path {
    home.path()
}

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_costpilot")
}

fn run_cmd(home: &TempDir, args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .env("COSTPILOT_HOME", home_path(home))
        .env("RUST_LOG", "warn")
        .env_remove("COSTPILOT_PROVIDER")
        .env_remove("COSTPILOT_AK")
        .output()
        .expect("run costpilot command")
}

fn config_file(home: &TempDir) -> PathBuf {
    home.path().join("config").join("config.toml")
}

fn add_fixture_account(home: &TempDir) {
    let fixture = home.path().join("fixture.json");
    fs::write(&fixture, FIXTURE).expect("write fixture");
    let output = run_cmd(
        home,
        &[
            "add-account",
            "--name",
            "demo",
            "--provider",
            "alibaba",
            "--access-key",
            "AK-DEMO",
            "--fixture",
            fixture.to_str().expect("utf-8 path"),
        ],
    );
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn init_creates_config_and_data_paths() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["init"]);
    assert!(output.status.success());

    assert!(home.path().join("config").exists());
    assert!(home.path().join("data").exists());
    assert!(config_file(&home).exists());
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("temp home");

    assert!(run_cmd(&home, &["init"]).status.success());
    let first = fs::read_to_string(config_file(&home)).expect("read config after first init");

    assert!(run_cmd(&home, &["init"]).status.success());
    let second = fs::read_to_string(config_file(&home)).expect("read config after second init");

    assert_eq!(first, second);
}

#[test]
fn report_requires_an_account() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["report", "--now", "2022-03-11"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No accounts configured"));
}

#[test]
fn report_rejects_unknown_format() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["report", "--format", "csv"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported output format. Use json or js."));
}

#[test]
fn windows_for_a_fixed_date() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["windows", "--now", "2022-03-11"]);
    assert!(output.status.success());

    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid json output");
    assert_eq!(parsed["now"], "2022-03-11");
    let windows = &parsed["windows"];
    assert_eq!(windows["recent-day"]["days"][0], "2022-03-10");
    assert_eq!(windows["previous-day"]["days"][0], "2022-03-09");
    assert_eq!(windows["month-to-date"]["days"].as_array().map(Vec::len), Some(10));
    assert_eq!(windows["trailing-24-months"]["months"][0], "2020-04");
}

#[test]
fn add_account_writes_config_without_secret() {
    let home = TempDir::new().expect("temp home");
    add_fixture_account(&home);
    let raw = fs::read_to_string(config_file(&home)).expect("read config");
    assert!(raw.contains("name = \"demo\""));
    assert!(raw.contains("provider = \"AlibabaCloud\""));
    assert!(!raw.contains("secret"));
}

#[test]
fn fixture_report_outputs_dashboard_json() {
    let home = TempDir::new().expect("temp home");
    add_fixture_account(&home);

    let output = run_cmd(&home, &["report", "--now", "2022-03-11"]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid json output");
    let day = &parsed["costAnalysisByDay"];
    assert_eq!(day["dataCycle"], "2022-03-10 23:59:59");
    assert_eq!(day["statistics"][0]["amount"], "30.00");
    assert_eq!(day["statistics"][0]["ratio"], "50.00");
    assert_eq!(parsed["costAnalysisByMonth"]["viewType"], "month");

    let utilization = &parsed["utilization"];
    assert_eq!(utilization["statistics"][0]["amount"], "50.00");
    assert_eq!(utilization["statistics"][2]["amount"], "2");
}

#[test]
fn js_report_is_written_to_file() {
    let home = TempDir::new().expect("temp home");
    add_fixture_account(&home);
    let target = home.path().join("dashboard.js");

    let output = run_cmd(
        &home,
        &[
            "report",
            "--now",
            "2022-03-11",
            "--format",
            "js",
            "--skip-utilization",
            "--output",
            target.to_str().expect("utf-8 path"),
        ],
    );
    assert!(output.status.success());
    let written = fs::read_to_string(&target).expect("read dashboard");
    assert!(written.starts_with("window.costAnalysis = {"));
    assert!(written.ends_with("};"));
    assert!(!written.contains("\"utilization\""));
}
