//! Shared fixtures for the binary-level tests
//!
//! `FakeEnv` writes a shell script that stands in for the Python interpreter.
//! It answers the environment probe, the library check, and `-m pip`
//! subcommands, recording every invocation in `calls.log`. Behaviour is
//! steered through environment variables:
//!
//! - `FAKE_TORCH=absent`: the probe reports that torch cannot be imported
//! - `FAKE_SUCCEED_ON=<token>`: a precompiled install containing that argument succeeds
//! - `FAKE_BUILD=ok|fail|hang`: outcome of the source build (`hang` execs `sleep 60`)
//! - `FAKE_INSTALLED=1`: the library is installed before the run starts

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

const FAKE_PYTHON: &str = r#"#!/bin/bash
state="$FAKE_STATE"
echo "$*" >> "$state/calls.log"

if [ "$1" = "-c" ]; then
    case "$2" in
        *"import torch"*)
            if [ "$FAKE_TORCH" = "absent" ]; then
                echo '{"python": "3.10.12", "torch_error": "No module named '"'"'torch'"'"'"}'
            else
                echo '{"python": "3.10.12", "torch": "2.3.1", "cuda": "12.1", "device": "Fake GPU 80GB"}'
            fi
            exit 0
            ;;
        *)
            if [ -f "$state/installed" ]; then
                echo "version=2.6.3"
                echo "entry=ok"
                echo "aux=ok"
                exit 0
            fi
            echo "error=ModuleNotFoundError: No module named 'flash_attn'"
            exit 10
            ;;
    esac
fi

if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
    shift 2
    case "$1" in
        install)
            if [[ " $* " == *" --no-build-isolation "* ]]; then
                echo $$ > "$state/build.pid"
                case "$FAKE_BUILD" in
                    hang) exec sleep 60 ;;
                    fail) echo "error: build failed" >&2; exit 1 ;;
                    *) touch "$state/installed"; exit 0 ;;
                esac
            fi
            if [ -n "$FAKE_SUCCEED_ON" ] && [[ " $* " == *" $FAKE_SUCCEED_ON "* ]]; then
                touch "$state/installed"
                exit 0
            fi
            echo "ERROR: No matching distribution found" >&2
            exit 1
            ;;
        uninstall)
            rm -f "$state/installed"
            exit 0
            ;;
        *)
            exit 0
            ;;
    esac
fi

exit 0
"#;

pub struct FakeEnv {
    dir: TempDir,
}

impl FakeEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let python = dir.path().join("python");
        fs::write(&python, FAKE_PYTHON).expect("write fake python");
        fs::set_permissions(&python, fs::Permissions::from_mode(0o755)).expect("chmod");

        let config = serde_json::json!({
            "python": python.to_string_lossy(),
            "cache_dirs": [],
            "disk_path": dir.path(),
            "min_free_space_gb": 0.0,
        });
        fs::write(dir.path().join("config.json"), config.to_string()).expect("write config");

        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("config.json")
    }

    pub fn mark_installed(&self) {
        fs::write(self.path().join("installed"), "").expect("mark installed");
    }

    pub fn is_installed(&self) -> bool {
        self.path().join("installed").exists()
    }

    /// Every fake interpreter invocation, one argument string per line
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    pub fn build_pid(&self) -> Option<u32> {
        fs::read_to_string(self.path().join("build.pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Wait until the fake build has written its pid
    pub fn wait_for_build_pid(&self, timeout: Duration) -> Option<u32> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(pid) = self.build_pid() {
                return Some(pid);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }

    /// `attn-install --config <fake> --no-color <args>` with piped stdio
    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_attn-install"));
        cmd.arg("--config")
            .arg(self.config_path())
            .arg("--no-color")
            .args(args)
            .env("FAKE_STATE", self.path())
            .env_remove("RUST_LOG")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Helper: Wait for a process to die with timeout
pub fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !attn_install::process_guard::is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}
