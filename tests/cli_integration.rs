use predicates::prelude::*;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const ENV_KEYS: [&str; 6] = [
    "ATOM_HOME",
    "ATOM_DEFAULT_CONFIG",
    "ATOM_GLOBAL_CONFIG",
    "ATOM_PROJECT_CONFIG_NAME",
    "ATOM_PROMPTS_DIR",
    "ATOM_AGENT_COMMAND",
];

struct EnvGuard {
    _lock: std::sync::MutexGuard<'static, ()>,
    originals: Vec<(String, Option<OsString>)>,
}

impl EnvGuard {
    fn new(keys: &[&str]) -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        let originals = keys
            .iter()
            .map(|key| ((*key).to_string(), env::var_os(key)))
            .collect();
        Self {
            _lock: lock,
            originals,
        }
    }

    fn set(&self, key: &str, value: impl AsRef<OsStr>) {
        unsafe {
            env::set_var(key, value);
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.originals.drain(..) {
            match value {
                Some(original) => unsafe {
                    env::set_var(&key, original);
                },
                None => unsafe {
                    env::remove_var(&key);
                },
            }
        }
    }
}

fn prepare_env(base: &Path) -> EnvGuard {
    let guard = EnvGuard::new(&ENV_KEYS);
    let home = base.join("atom-home");
    let prompts_dir = home.join("prompts");
    fs::create_dir_all(&prompts_dir).unwrap();
    fs::write(
        prompts_dir.join("ATOM.md"),
        "Loop prompt. Cap {max_iterations}. Emit EXIT_LOOP_NOW when done.\n",
    )
    .unwrap();

    let config_path = base.join("default.yaml");
    fs::write(&config_path, "defaults:\n  max_iterations: 25\n").unwrap();

    guard.set("ATOM_HOME", &home);
    guard.set("ATOM_DEFAULT_CONFIG", &config_path);
    guard.set("ATOM_GLOBAL_CONFIG", base.join("missing-global.yaml"));
    guard.set("ATOM_PROJECT_CONFIG_NAME", ".atom.yaml");
    guard.set("ATOM_PROMPTS_DIR", "");
    guard
}

#[cfg(unix)]
fn write_agent_script(base: &Path, contents: &str) -> PathBuf {
    let path = base.join("agent-stub");
    fs::write(&path, contents).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn project_dir(base: &Path) -> PathBuf {
    let dir = base.join("project");
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn cli_help_shows_overview() {
    let temp = tempfile::tempdir().unwrap();
    let _guard = prepare_env(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Autonomous iteration driver"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn cli_rejects_invalid_args() {
    let temp = tempfile::tempdir().unwrap();
    let _guard = prepare_env(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.arg("--definitely-invalid");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn cli_version_prints_crate_version() {
    let temp = tempfile::tempdir().unwrap();
    let _guard = prepare_env(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.arg("version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("atom v"));
}

#[test]
fn cli_init_creates_user_scope_layout() {
    let temp = tempfile::tempdir().unwrap();
    let _guard = prepare_env(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.arg("init");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("User scope:"));

    let home = temp.path().join("atom-home");
    for name in ["bin", "tools", "prompts"] {
        assert!(home.join(name).is_dir());
    }
}

#[test]
fn cli_prompts_lists_resolvable_prompts() {
    let temp = tempfile::tempdir().unwrap();
    let _guard = prepare_env(temp.path());
    let project = project_dir(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.arg("prompts").current_dir(&project);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("ATOM"));
}

#[test]
fn cli_config_get_reads_merged_value() {
    let temp = tempfile::tempdir().unwrap();
    let _guard = prepare_env(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.args(["config", "get", "defaults.max_iterations"]);

    cmd.assert().success().stdout(predicate::str::contains("25"));
}

#[cfg(unix)]
#[test]
fn cli_run_succeeds_against_stub_agent() {
    let temp = tempfile::tempdir().unwrap();
    let guard = prepare_env(temp.path());
    let project = project_dir(temp.path());
    let script = write_agent_script(
        temp.path(),
        "#!/bin/sh\necho 'task complete. EXIT_LOOP_NOW'\n",
    );
    guard.set("ATOM_AGENT_COMMAND", &script);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.args(["run", "--quiet", "--dir"])
        .arg(&project)
        .arg("say hello");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("EXIT_LOOP_NOW"));

    let prompt_file = project.join("USER_PROMPT.md");
    assert_eq!(fs::read_to_string(prompt_file).unwrap(), "say hello");
}

#[cfg(unix)]
#[test]
fn cli_run_reads_task_from_prompt_file_when_omitted() {
    let temp = tempfile::tempdir().unwrap();
    let guard = prepare_env(temp.path());
    let project = project_dir(temp.path());
    fs::write(project.join("USER_PROMPT.md"), "task from file").unwrap();
    let script = write_agent_script(temp.path(), "#!/bin/sh\necho 'EXIT_LOOP_NOW'\n");
    guard.set("ATOM_AGENT_COMMAND", &script);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.args(["run", "--quiet", "--dir"]).arg(&project);

    cmd.assert().success();
}

#[cfg(unix)]
#[test]
fn cli_run_exhaustion_exits_nonzero_with_reason() {
    let temp = tempfile::tempdir().unwrap();
    let guard = prepare_env(temp.path());
    let project = project_dir(temp.path());
    let script = write_agent_script(temp.path(), "#!/bin/sh\necho 'still thinking'\n");
    guard.set("ATOM_AGENT_COMMAND", &script);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.args(["run", "--quiet", "--max-iterations", "2", "--dir"])
        .arg(&project)
        .arg("never done");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("max_iterations"));
}

#[cfg(unix)]
#[test]
fn cli_run_missing_agent_reports_child_not_found() {
    let temp = tempfile::tempdir().unwrap();
    let guard = prepare_env(temp.path());
    let project = project_dir(temp.path());
    guard.set("ATOM_AGENT_COMMAND", "/nonexistent/atom-agent-binary");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.args(["run", "--quiet", "--dir"])
        .arg(&project)
        .arg("anything");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("child_not_found"));
}

#[cfg(unix)]
#[test]
fn cli_run_json_emits_structured_outcome() {
    let temp = tempfile::tempdir().unwrap();
    let guard = prepare_env(temp.path());
    let project = project_dir(temp.path());
    let script = write_agent_script(temp.path(), "#!/bin/sh\necho 'EXIT_LOOP_NOW'\n");
    guard.set("ATOM_AGENT_COMMAND", &script);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.args(["run", "--quiet", "--json", "--dir"])
        .arg(&project)
        .arg("say hello");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"success\": true"))
        .stdout(predicate::str::contains("\"iterations\": 1"))
        .stdout(predicate::str::contains("\"context\""));
}

#[cfg(unix)]
#[test]
fn cli_run_cleanup_removes_prompt_file_on_success() {
    let temp = tempfile::tempdir().unwrap();
    let guard = prepare_env(temp.path());
    let project = project_dir(temp.path());
    let script = write_agent_script(temp.path(), "#!/bin/sh\necho 'EXIT_LOOP_NOW'\n");
    guard.set("ATOM_AGENT_COMMAND", &script);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.args(["run", "--quiet", "--cleanup", "--dir"])
        .arg(&project)
        .arg("tidy task");

    cmd.assert().success();
    assert!(!project.join("USER_PROMPT.md").exists());
}

#[cfg(unix)]
#[test]
fn cli_run_uses_toolname_prompt() {
    let temp = tempfile::tempdir().unwrap();
    let guard = prepare_env(temp.path());
    let project = project_dir(temp.path());
    let prompts_dir = temp.path().join("atom-home").join("prompts");
    fs::write(prompts_dir.join("ECHOCHECK.md"), "Echo check prompt.\n").unwrap();
    // The stub prints its argv, so the composed prompt is visible in stdout.
    let script = write_agent_script(
        temp.path(),
        "#!/bin/sh\nprintf '%s ' \"$@\"\necho 'EXIT_LOOP_NOW'\n",
    );
    guard.set("ATOM_AGENT_COMMAND", &script);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("atom");
    cmd.args(["run", "--quiet", "--toolname", "atom_echocheck", "--dir"])
        .arg(&project)
        .arg("layered prompt task");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Echo check prompt."));
}
