//! Test utilities for stackwright-lib.
//!
//! Cross-platform helpers for tests that run shell commands or need a
//! throwaway git repository.

use std::fs;
use std::path::Path;
use std::process::Command;

/// Returns the shell command and args to execute a shell script.
#[cfg(unix)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

#[cfg(windows)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("cmd.exe", vec!["/C".to_string(), script.to_string()])
}

/// Returns the shell command and args to write `$var` into `file`.
#[cfg(unix)]
pub fn shell_write_env(var: &str, file: &str) -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), format!("printf '%s' \"${}\" > {}", var, file)])
}

#[cfg(windows)]
pub fn shell_write_env(var: &str, file: &str) -> (&'static str, Vec<String>) {
  ("cmd.exe", vec!["/C".to_string(), format!("<nul set /p =%{}%> {}", var, file)])
}

/// Returns the command and args of a step that always fails.
#[cfg(unix)]
pub fn failing_cmd() -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), "exit 3".to_string()])
}

#[cfg(windows)]
pub fn failing_cmd() -> (&'static str, Vec<String>) {
  ("cmd.exe", vec!["/C".to_string(), "exit 3".to_string()])
}

/// Run `git` in `dir` with a fixed identity.
///
/// Returns `None` when git is not installed.
pub fn git(dir: &Path, args: &[&str]) -> Option<String> {
  let output = Command::new("git")
    .current_dir(dir)
    .args(["-c", "user.name=Stackwright Test", "-c", "user.email=test@example.com"])
    .args(["-c", "init.defaultBranch=main", "-c", "commit.gpgsign=false"])
    .args(args)
    .output()
    .ok()?;

  assert!(
    output.status.success(),
    "git {:?} failed: {}",
    args,
    String::from_utf8_lossy(&output.stderr)
  );
  Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Create a repository at `dir` with one commit holding `files`.
///
/// Returns the remote URL to clone from and the commit id, or `None` when
/// git is not installed.
pub fn git_repo(dir: &Path, files: &[(&str, &str)]) -> Option<(String, String)> {
  fs::create_dir_all(dir).unwrap();
  git(dir, &["init", "-q"])?;

  for (path, content) in files {
    let target = dir.join(path);
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(target, content).unwrap();
  }

  git(dir, &["add", "-A"])?;
  git(dir, &["commit", "-qm", "initial"])?;
  let commit = git(dir, &["rev-parse", "HEAD"])?;
  Some((dir.to_string_lossy().into_owned(), commit))
}
