//! Python runtime manager for the model, training and generation helpers.
//!
//! Helpers receive one JSON request on stdin and answer with a JSON envelope on the
//! last line of stdout: `{"ok": true, "result": ...}` or `{"ok": false, "error": "..."}`.
//! Their stderr (library logs, progress) is forwarded line by line to `tracing`.
//! Long-lived helpers ([`PythonWorker`]) speak the same envelope, one line per request.

use crate::config::RuntimeConfig;
use crate::error::{Result, TuneError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Number of stderr lines kept for error reports.
const STDERR_TAIL: usize = 20;

/// Information about the detected Python installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub has_pip: bool,
    pub venv_path: Option<PathBuf>,
}

/// Managed Python subprocess runner.
///
/// Not `Debug`: the environment may carry the hub token.
#[derive(Clone)]
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
    timeout: Option<Duration>,
    env: Vec<(String, String)>,
}

impl PythonRuntime {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            venv_path: None,
            workspace,
            timeout: None,
            env: Vec::new(),
        }
    }

    pub fn from_config(config: &RuntimeConfig, workspace: PathBuf) -> Self {
        Self {
            python_path: config
                .python_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("python3")),
            venv_path: config.venv_path.clone(),
            workspace,
            timeout: config.timeout_secs.map(Duration::from_secs),
            env: Vec::new(),
        }
    }

    /// Add an environment variable passed to every helper process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Detect available Python installation.
    pub async fn detect() -> Result<PythonInfo> {
        for cmd in &["python3", "python"] {
            let Ok(output) = Command::new(cmd).arg("--version").output().await else {
                continue;
            };
            if !output.status.success() {
                continue;
            }
            let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if version.is_empty() {
                version = String::from_utf8_lossy(&output.stderr).trim().to_string();
            }

            let has_pip = Command::new(cmd)
                .args(["-m", "pip", "--version"])
                .output()
                .await
                .is_ok_and(|o| o.status.success());

            return Ok(PythonInfo {
                path: PathBuf::from(cmd),
                version,
                has_pip,
                venv_path: detect_venv(),
            });
        }

        Err(TuneError::python(
            "Python not found. Install Python 3.10+ with torch and transformers.",
        ))
    }

    /// The interpreter actually invoked (venv interpreter wins).
    pub fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    fn command(&self, script: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(self.python_cmd());
        cmd.arg("-c")
            .arg(script)
            .args(args)
            .current_dir(&self.workspace)
            .env("PYTHONUNBUFFERED", "1")
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run a helper to completion and return the `result` of its envelope.
    pub async fn run_script(&self, script: &str, args: &[&str], input: &Value) -> Result<Value> {
        let payload = serde_json::to_vec(input)?;
        debug!(args = ?args, input_bytes = payload.len(), "Running Python helper");

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_once(script, args, &payload))
                .await
                .map_err(|_| {
                    TuneError::Timeout(format!(
                        "Python helper timed out after {}s",
                        limit.as_secs()
                    ))
                })?,
            None => self.run_once(script, args, &payload).await,
        }
    }

    async fn run_once(&self, script: &str, args: &[&str], payload: &[u8]) -> Result<Value> {
        let mut child = self
            .command(script, args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TuneError::python(format!("Failed to spawn Python: {e}")))?;

        let stderr_task = forward_stderr(&mut child);

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let tail = collect_tail(stderr_task).await;
        let stdout = String::from_utf8_lossy(&output.stdout);

        match (output.status.success(), last_json_line(&stdout)) {
            (_, Some(envelope)) => unwrap_envelope(envelope),
            (true, None) => Err(TuneError::python("helper produced no JSON result")),
            (false, None) => Err(TuneError::python(format!(
                "helper failed ({}): {}",
                output.status,
                tail.join("\n")
            ))),
        }
    }

    /// Start a long-lived helper and wait for its ready envelope.
    pub async fn spawn_worker(
        &self,
        script: &str,
        args: &[&str],
        input: &Value,
    ) -> Result<PythonWorker> {
        let mut child = self
            .command(script, args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TuneError::python(format!("Failed to spawn Python worker: {e}")))?;

        let stderr_task = forward_stderr(&mut child);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TuneError::python("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TuneError::python("worker stdout unavailable"))?;

        let mut worker = PythonWorker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_task: Some(stderr_task),
            timeout: self.timeout,
        };
        // The first exchange carries the load request; its reply signals readiness.
        worker.request(input).await?;
        Ok(worker)
    }

    /// Installed version of each package, `None` when it cannot be imported.
    pub async fn package_versions(&self, packages: &[String]) -> BTreeMap<String, Option<String>> {
        let mut versions = BTreeMap::new();
        for pkg in packages {
            let script = format!(
                "import importlib.metadata as m; print(m.version('{}'))",
                pkg.replace('\'', "")
            );
            let version = Command::new(self.python_cmd())
                .args(["-c", &script])
                .output()
                .await
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
            versions.insert(pkg.clone(), version);
        }
        versions
    }

    /// Install packages via pip.
    pub async fn ensure_packages(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!(packages = ?packages, "Installing Python packages");

        let output = Command::new(self.python_cmd())
            .args(["-m", "pip", "install", "--quiet"])
            .args(packages)
            .current_dir(&self.workspace)
            .output()
            .await
            .map_err(|e| TuneError::python(format!("Failed to run pip: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TuneError::python(format!("pip install failed: {stderr}")));
        }
        Ok(())
    }
}

/// A running helper answering one JSON line per request.
pub struct PythonWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<VecDeque<String>>>,
    timeout: Option<Duration>,
}

impl PythonWorker {
    /// Send one request and wait for its envelope.
    pub async fn request(&mut self, request: &Value) -> Result<Value> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let next = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.stdout.next_line())
                .await
                .map_err(|_| {
                    TuneError::Timeout(format!(
                        "Python worker did not answer within {}s",
                        limit.as_secs()
                    ))
                })??,
            None => self.stdout.next_line().await?,
        };

        match next {
            Some(line) => {
                let envelope: Value = serde_json::from_str(line.trim()).map_err(|e| {
                    TuneError::python(format!("worker sent malformed reply: {e}"))
                })?;
                unwrap_envelope(envelope)
            }
            None => {
                let tail = match self.stderr_task.take() {
                    Some(task) => collect_tail(task).await,
                    None => Vec::new(),
                };
                Err(TuneError::python(format!(
                    "worker exited unexpectedly: {}",
                    tail.join("\n")
                )))
            }
        }
    }

    /// Ask the worker to exit and wait for it.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self
            .stdin
            .write_all(b"{\"op\": \"shutdown\"}\n")
            .await;
        let _ = self.stdin.flush().await;
        self.child.wait().await?;
        if let Some(task) = self.stderr_task.take() {
            collect_tail(task).await;
        }
        Ok(())
    }
}

fn forward_stderr(child: &mut Child) -> JoinHandle<VecDeque<String>> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        let Some(stderr) = stderr else {
            return tail;
        };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            info!(target: "sfttune::python", "{line}");
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    })
}

async fn collect_tail(task: JoinHandle<VecDeque<String>>) -> Vec<String> {
    task.await.map(Vec::from).unwrap_or_default()
}

fn last_json_line(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| serde_json::from_str(l).ok())
}

fn unwrap_envelope(envelope: Value) -> Result<Value> {
    match envelope.get("ok").and_then(Value::as_bool) {
        Some(true) => Ok(envelope.get("result").cloned().unwrap_or(Value::Null)),
        Some(false) => Err(TuneError::python(
            envelope
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("helper reported an unspecified error")
                .to_string(),
        )),
        None => Err(TuneError::python(format!(
            "helper reply is not an envelope: {envelope}"
        ))),
    }
}

/// Detect a virtual environment in common locations.
fn detect_venv() -> Option<PathBuf> {
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        let path = PathBuf::from(venv);
        if path.exists() {
            return Some(path);
        }
    }
    [".venv", "venv"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_json_line_skips_noise() {
        let stdout = "loading...\n{\"ok\": true, \"result\": 3}\n\n";
        assert_eq!(last_json_line(stdout), Some(json!({"ok": true, "result": 3})));
        assert_eq!(last_json_line("no json here"), None);
    }

    #[test]
    fn test_unwrap_envelope() {
        assert_eq!(
            unwrap_envelope(json!({"ok": true, "result": {"a": 1}})).unwrap(),
            json!({"a": 1})
        );
        let err = unwrap_envelope(json!({"ok": false, "error": "CUDA out of memory"})).unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
        assert!(unwrap_envelope(json!([1, 2])).is_err());
    }

    #[test]
    fn test_venv_interpreter_wins() {
        let config = RuntimeConfig {
            python_path: Some(PathBuf::from("/usr/bin/python3.11")),
            venv_path: Some(PathBuf::from("/opt/venv")),
            ..RuntimeConfig::default()
        };
        let runtime = PythonRuntime::from_config(&config, PathBuf::from("."));
        let expected = if cfg!(windows) {
            PathBuf::from("/opt/venv/Scripts/python")
        } else {
            PathBuf::from("/opt/venv/bin/python")
        };
        assert_eq!(runtime.python_cmd(), expected);
    }

    #[tokio::test]
    async fn test_python_detect() {
        // Python may or may not be available where tests run.
        if let Ok(info) = PythonRuntime::detect().await {
            assert!(!info.version.is_empty());
        }
    }

    #[tokio::test]
    async fn test_run_script_roundtrip_when_python_present() {
        if PythonRuntime::detect().await.is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let runtime = PythonRuntime::new(dir.path().to_path_buf());
        let script = "import sys, json\nreq = json.load(sys.stdin)\nprint('noise')\nprint(json.dumps({'ok': True, 'result': req['n'] * 2}))";
        let result = runtime.run_script(script, &[], &json!({"n": 21})).await.unwrap();
        assert_eq!(result, json!(42));
    }
}
