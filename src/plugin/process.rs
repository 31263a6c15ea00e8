//! Plugin process supervision
//!
//! Spawns a plugin executable in its own process group, reads its handshake
//! line, forwards the rest of its stdout/stderr to the log and terminates
//! the whole process tree on shutdown.

use crate::driver::Secrets;
use crate::error::TransportError;
use crate::plugin::handshake::HandshakeConfig;
use crate::plugin::session::Session;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// A running plugin process.
pub struct PluginProcess {
    /// Process ID; also the process group ID on unix
    pid: u32,
    /// Base name of the executable, used to tag forwarded output
    name: String,
    child: Child,
    forwarders: Vec<JoinHandle<()>>,
    /// Set once the tree has been killed and the child waited on
    reaped: bool,
}

impl PluginProcess {
    /// Spawn the plugin and wait for its handshake line.
    ///
    /// Secrets are appended to the inherited environment as `KEY=VALUE`
    /// entries, followed by the handshake entries. On any failure the
    /// process tree is killed before returning.
    pub async fn spawn(
        executable: &Path,
        secrets: &Secrets,
        handshake: &HandshakeConfig,
        start_timeout: Duration,
    ) -> Result<(Self, String), TransportError> {
        let name = handshake.magic_cookie_value.clone();

        let mut cmd = Command::new(executable);
        cmd.envs(secrets.iter())
            .envs(handshake.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        create_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::SpawnFailed(format!("{}: {e}", executable.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| TransportError::SpawnFailed("Failed to get process ID".to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut process = Self {
            pid,
            name,
            child,
            forwarders: Vec::with_capacity(2),
            reaped: false,
        };

        if let Some(stderr) = stderr {
            process.forward(BufReader::new(stderr).lines(), "stderr");
        }

        let Some(stdout) = stdout else {
            process.kill_tree().await;
            return Err(TransportError::SpawnFailed(
                "stdout is not available".to_string(),
            ));
        };
        let mut lines = BufReader::new(stdout).lines();

        match timeout(start_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                process.forward_stdout(lines);
                tracing::debug!(plugin = %process.name, pid, "Plugin process started");
                Ok((process, line))
            }
            Ok(Ok(None)) => {
                process.kill_tree().await;
                Err(TransportError::Handshake(
                    "plugin exited before completing the handshake".to_string(),
                ))
            }
            Ok(Err(e)) => {
                process.kill_tree().await;
                Err(TransportError::Handshake(format!(
                    "failed to read handshake: {e}"
                )))
            }
            Err(_) => {
                process.kill_tree().await;
                Err(TransportError::Handshake(format!(
                    "timed out after {}ms waiting for handshake",
                    start_timeout.as_millis()
                )))
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn forward_stdout(&mut self, lines: Lines<BufReader<ChildStdout>>) {
        self.forward(lines, "stdout");
    }

    fn forward<R>(&mut self, mut lines: Lines<BufReader<R>>, stream: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = self.name.clone();
        self.forwarders.push(tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        tracing::info!(target: "plugin", plugin = %name, stream, "{}", line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(plugin = %name, stream, error = %e, "Output forwarding failed");
                        break;
                    }
                }
            }
        }));
    }

    /// Disconnect gracefully and wait for the process to exit, killing the
    /// whole tree if that does not happen within `grace`.
    ///
    /// The tree is signalled even after a clean exit so that grandchildren
    /// left in the group do not outlive the plugin.
    pub async fn shutdown(mut self, session: Option<&dyn Session>, grace: Duration) {
        let graceful = timeout(grace, async {
            if let Some(session) = session {
                if let Err(e) = session.close().await {
                    tracing::debug!(plugin = %self.name, error = %e, "Graceful disconnect failed");
                }
            }
            self.child.wait().await
        })
        .await;

        match graceful {
            Ok(Ok(status)) => {
                tracing::debug!(plugin = %self.name, %status, "Plugin process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(plugin = %self.name, error = %e, "Failed to wait for plugin process");
            }
            Err(_) => {
                tracing::warn!(
                    plugin = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "Plugin did not exit in time, killing process tree"
                );
            }
        }

        self.kill_tree().await;
    }

    /// Force-kill the process and everything it spawned.
    ///
    /// Failures are logged only: the tree may already be gone.
    pub async fn kill_tree(&mut self) {
        if let Err(e) = kill_tree(self.pid).await {
            tracing::debug!(plugin = %self.name, pid = self.pid, error = %e, "Process tree kill failed");
        }
        if let Err(e) = self.child.start_kill() {
            tracing::trace!(plugin = %self.name, error = %e, "Process already exited");
        }
        if timeout(Duration::from_secs(5), self.child.wait()).await.is_err() {
            tracing::warn!(plugin = %self.name, pid = self.pid, "Process did not exit after kill");
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        self.reaped = true;
    }
}

/// A shutdown abandoned part way still takes the group down with it;
/// `kill_on_drop` alone only reaches the direct child.
impl Drop for PluginProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = signal_group(self.pid) {
            tracing::trace!(plugin = %self.name, pid = self.pid, error = %e, "Process group already gone");
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

#[cfg(unix)]
fn create_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn create_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
async fn kill_tree(pid: u32) -> std::io::Result<()> {
    signal_group(pid)
}

#[cfg(unix)]
fn signal_group(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    killpg(Pid::from_raw(pgid), Signal::SIGKILL).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn signal_group(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(windows)]
async fn kill_tree(pid: u32) -> std::io::Result<()> {
    let status = timeout(
        Duration::from_secs(5),
        Command::new("taskkill")
            .args(["/pid", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status(),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "taskkill timed out"))??;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("taskkill exited with {status}"),
        ))
    }
}

#[cfg(not(any(unix, windows)))]
async fn kill_tree(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_spawn_reads_handshake_and_injects_env() {
        let dir = TempDir::new().unwrap();
        let path = write_script(
            &dir,
            "stucco-env",
            r#"echo "1|1|tcp|$API_KEY|$STUCCO_DRIVER_PLUGIN"; sleep 30"#,
        );
        let secrets = Secrets::from([("API_KEY".to_string(), "hunter2".to_string())]);
        let handshake = HandshakeConfig::for_executable(&path);

        let (mut process, line) =
            PluginProcess::spawn(&path, &secrets, &handshake, Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(line, "1|1|tcp|hunter2|stucco-env");
        assert_eq!(process.name(), "stucco-env");
        assert!(process.is_running());

        process.kill_tree().await;
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_spawn_fails_when_plugin_exits_early() {
        let dir = TempDir::new().unwrap();
        let path = write_script(&dir, "stucco-quit", "exit 3");
        let handshake = HandshakeConfig::for_executable(&path);

        let result =
            PluginProcess::spawn(&path, &Secrets::new(), &handshake, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let path = Path::new("/nonexistent/stucco-missing");
        let handshake = HandshakeConfig::for_executable(path);
        let result =
            PluginProcess::spawn(path, &Secrets::new(), &handshake, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_shutdown_kills_process_group() {
        let dir = TempDir::new().unwrap();
        // The grandchild would survive a plain kill of the shell.
        let path = write_script(
            &dir,
            "stucco-tree",
            r#"sleep 60 & echo "1|1|tcp|$!|jsonrpc"; wait"#,
        );
        let handshake = HandshakeConfig::for_executable(&path);
        let (process, line) =
            PluginProcess::spawn(&path, &Secrets::new(), &handshake, Duration::from_secs(5))
                .await
                .unwrap();
        let grandchild: i32 = line.split('|').nth(3).unwrap().parse().unwrap();

        let started = std::time::Instant::now();
        process.shutdown(None, Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!is_alive(grandchild), "grandchild {grandchild} survived the tree kill");
    }

    #[tokio::test]
    async fn test_dropping_process_kills_group() {
        let dir = TempDir::new().unwrap();
        let path = write_script(
            &dir,
            "stucco-dropped",
            r#"sleep 60 & echo "1|1|tcp|$!|jsonrpc"; wait"#,
        );
        let handshake = HandshakeConfig::for_executable(&path);
        let (process, line) =
            PluginProcess::spawn(&path, &Secrets::new(), &handshake, Duration::from_secs(5))
                .await
                .unwrap();
        let grandchild: i32 = line.split('|').nth(3).unwrap().parse().unwrap();

        // Abandon a shutdown before its grace period runs out.
        let shutdown = process.shutdown(None, Duration::from_secs(30));
        assert!(tokio::time::timeout(Duration::from_millis(100), shutdown)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!is_alive(grandchild), "grandchild {grandchild} survived the dropped shutdown");
    }

    /// A killed orphan may linger as a zombie until init reaps it.
    fn is_alive(pid: i32) -> bool {
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
            Err(_) => true,
        }
    }
}
