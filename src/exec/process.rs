use std::{ffi::OsStr, path::Path, process::Stdio, time::Duration};
use tokio::{process::Command, time::timeout};

use super::toolchain::CommandSpec;

#[derive(Debug, Clone)]
pub struct Finished {
    pub code:   Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Finished {
    pub fn success(&self) -> bool { self.code == Some(0) }

    pub fn exit_description(&self) -> String {
        match self.code {
            Some(c) => format!("Process exited with code {c}"),
            None    => "Process was terminated by a signal".into(),
        }
    }
}

/// Runs `spec` in `cwd` with `path` as its PATH. `Ok(None)` means the limit
/// elapsed; the process and everything in its group have been killed.
pub async fn run_bounded(
    spec:  &CommandSpec,
    cwd:   &Path,
    path:  &OsStr,
    limit: Duration,
) -> std::io::Result<Option<Finished>> {
    let mut std_cmd = std::process::Command::new(&spec.program);
    std_cmd
        .args(&spec.args)
        .current_dir(cwd)
        .env("PATH", path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    let child = Command::from(std_cmd).kill_on_drop(true).spawn()?;
    let pid = child.id();

    match timeout(limit, child.wait_with_output()).await {
        Ok(out) => {
            let out = out?;
            Ok(Some(Finished {
                code:   out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }))
        }
        Err(_) => {
            // the dropped future already killed the direct child
            kill_tree(pid);
            Ok(None)
        }
    }
}

#[cfg(unix)]
fn kill_tree(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // SAFETY: plain syscall; the group was created for this child by process_group(0).
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_tree(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
}
