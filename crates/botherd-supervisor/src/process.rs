use std::{path::Path, process::ExitStatus, time::Duration};

use anyhow::Context;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies (crash/kill), make sure the client goes too.
    // NOTE: `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Exclusive wrapper for one spawned game client.
///
/// Liveness is polled (`try_wait`) rather than event-driven; callers must
/// treat "alive" as momentarily stale between checks.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    pgid: Option<i32>,
}

/// A fresh spawn plus its piped output streams, handed to log capture.
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    pub fn spawn(exec: &str, args: &[String], cwd: &Path) -> anyhow::Result<SpawnedProcess> {
        let mut cmd = Command::new(exec);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // Start a new session so we can signal the whole client tree.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn client: exec={exec} (cwd {})", cwd.display()))?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(SpawnedProcess {
            handle: ProcessHandle { child, pid, pgid },
            stdout,
            stderr,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Polls the OS for liveness. A wait error is reported as dead.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Sends SIGTERM to the client's process group (unix), falling back to
    /// killing just the direct child.
    pub fn terminate(&mut self) -> anyhow::Result<()> {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
            if rc == 0 {
                return Ok(());
            }
        }
        self.child.start_kill().context("signal child")
    }

    /// Forceful SIGKILL escalation.
    pub fn kill(&mut self) -> anyhow::Result<()> {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc == 0 {
                return Ok(());
            }
        }
        self.child.start_kill().context("kill child")
    }

    /// Waits for exit up to `timeout`. `None` means the deadline passed with
    /// the process still running (or the wait itself failed).
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

/// Probes a PID inherited from a previous supervisor invocation.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // A pid above i32::MAX would go negative in the cast and address a
        // process group instead.
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Courtesy SIGTERM for a reattached PID we do not own.
pub fn terminate_pid(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> SpawnedProcess {
        ProcessHandle::spawn(
            "/bin/sh",
            &["-c".to_string(), script.to_string()],
            &PathBuf::from("/tmp"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn spawn_and_terminate() {
        let mut p = sh("sleep 30").handle;
        assert!(p.is_alive());
        p.terminate().unwrap();
        assert!(p.wait_timeout(Duration::from_secs(5)).await.is_some());
        assert!(!p.is_alive());
    }

    #[tokio::test]
    async fn kill_escapes_sigterm_trap() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let script = format!(
            "trap '' TERM; : > {}; while :; do sleep 1; done",
            ready.display()
        );
        let mut p = ProcessHandle::spawn(
            "/bin/sh",
            &["-c".to_string(), script],
            dir.path(),
        )
        .unwrap()
        .handle;
        // Don't signal until the shell has installed the trap.
        for _ in 0..250 {
            if ready.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ready.exists());

        p.terminate().unwrap();
        // The trap swallows SIGTERM; the process must survive it.
        assert!(p.wait_timeout(Duration::from_secs(1)).await.is_none());
        p.kill().unwrap();
        assert!(p.wait_timeout(Duration::from_secs(5)).await.is_some());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let res = ProcessHandle::spawn(
            "/nonexistent/definitely-not-a-binary",
            &[],
            &PathBuf::from("/tmp"),
        );
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn external_pid_probing() {
        assert!(pid_alive(std::process::id()));
        let mut p = sh("exit 0").handle;
        let pid = p.pid().unwrap();
        p.wait_timeout(Duration::from_secs(5)).await.unwrap();
        // Reaped child: the PID no longer answers signal 0 from us.
        assert!(!pid_alive(pid));
    }
}
