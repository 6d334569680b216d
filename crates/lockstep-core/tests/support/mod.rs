//! Shared fixtures: real git working trees in temporary directories.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::process::Command;

use lockstep_core::StateManager;
use lockstep_core::config::{GitConfig, ProjectConfig};
use lockstep_core::vcs::GitRepo;
use tempfile::TempDir;

pub const AUTHOR_NAME: &str = "lockstep-test";
pub const AUTHOR_EMAIL: &str = "test@lockstep.invalid";

pub fn config() -> ProjectConfig {
    let mut config = ProjectConfig::default();
    config.git = GitConfig {
        author_name: Some(AUTHOR_NAME.to_string()),
        author_email: Some(AUTHOR_EMAIL.to_string()),
        ..GitConfig::default()
    };
    config
}

/// Empty git repository, no store.
pub fn empty_repo() -> TempDir {
    let dir = TempDir::new().expect("create temp dir");
    GitRepo::init(dir.path(), &config().git).expect("git init");
    dir
}

/// Git repository with a bootstrapped store.
pub fn initialized() -> (TempDir, StateManager) {
    initialized_with(config())
}

pub fn initialized_with(config: ProjectConfig) -> (TempDir, StateManager) {
    let dir = empty_repo();
    let manager = StateManager::init_with(dir.path(), config).expect("init state manager");
    (dir, manager)
}

/// Epic 5 "Auth", the fixture most scenarios start from.
pub fn with_auth_epic() -> (TempDir, StateManager) {
    let (dir, mut manager) = initialized();
    manager
        .create_epic(5, "Auth", "Authentication work.\n")
        .expect("create epic 5");
    (dir, manager)
}

/// Run git directly, the way a human would outside the API.
pub fn git(root: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-c")
        .arg(format!("user.name={AUTHOR_NAME}"))
        .arg("-c")
        .arg(format!("user.email={AUTHOR_EMAIL}"))
        .args(args)
        .current_dir(root)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Write `rel` and commit it with `message`, bypassing the API.
pub fn commit_file(root: &Path, rel: &str, content: &str, message: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&path, content).expect("write file");
    git(root, &["add", "--", rel]);
    git(root, &["commit", "-q", "-m", message]);
}

/// Install an executable hook script.
#[cfg(unix)]
pub fn install_hook(root: &Path, name: &str, script: &str) {
    use std::os::unix::fs::PermissionsExt;
    let hooks = root.join(".git").join("hooks");
    fs::create_dir_all(&hooks).expect("create hooks dir");
    let path = hooks.join(name);
    fs::write(&path, script).expect("write hook");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod hook");
}

#[cfg(unix)]
pub fn remove_hook(root: &Path, name: &str) {
    fs::remove_file(root.join(".git").join("hooks").join(name)).expect("remove hook");
}

/// Commit subjects, oldest first.
pub fn subjects(root: &Path) -> Vec<String> {
    git(root, &["log", "--reverse", "--format=%s"])
        .lines()
        .map(ToOwned::to_owned)
        .collect()
}

/// Snapshot of every file under `root` except `.git` and SQLite sidecars.
pub fn tree_snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("dir entry").path())
            .collect();
        entries.sort();
        for path in entries {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            // Sidecars belong to the live connection, not to the tree.
            if name == ".git" || ["-wal", "-shm", "-journal"].iter().any(|s| name.ends_with(s)) {
                continue;
            }
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path
                    .strip_prefix(root)
                    .expect("under root")
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push((rel, fs::read(&path).expect("read file")));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out
}
