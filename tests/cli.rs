use assert_cmd::Command;

fn leadflow_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("leadflow").expect("leadflow test binary should build")
    }
}

#[test]
fn version_prints_and_exits_zero() {
    leadflow_bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("leadflow"));
}

#[test]
fn help_lists_run_modes() {
    leadflow_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("serve"))
        .stdout(predicates::str::contains("worker"));
}

#[test]
fn unknown_command_exits_nonzero() {
    leadflow_bin().arg("bogus").assert().failure();
}

#[test]
fn missing_config_fails_startup_with_exit_code_one() {
    leadflow_bin()
        .arg("serve")
        .env("LEADFLOW_CONFIG", "/nonexistent/config.toml")
        .assert()
        .code(1);
}

#[test]
fn invalid_live_config_fails_validation() {
    let dir = std::env::temp_dir().join("leadflow-cli-test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("bad-config.toml");
    std::fs::write(&path, "[service]\ndry_run = false\n").unwrap();

    leadflow_bin()
        .arg("serve")
        .env("LEADFLOW_CONFIG", &path)
        .assert()
        .code(1)
        .stderr(predicates::str::contains("crm.client_id"));
}
