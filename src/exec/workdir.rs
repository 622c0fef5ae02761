//! Per-job scratch directories and the PATH handed to every child process.
use std::{
    ffi::OsString,
    path::{Component, Path, PathBuf},
};
use tokio::fs;

use super::{toolchain::Platform, SourceFile};
use crate::error::ExecError;

/// Folder under the temp root that holds the shared Python venv.
pub const VENV_DIR: &str = "pyenv";

/// Well-known install locations that a service account's PATH usually lacks.
fn windows_tool_dirs(user: &str) -> Vec<String> {
    let mut dirs: Vec<String> = [
        r"C:\Python311",
        r"C:\Python310",
        r"C:\Python39",
        r"C:\Python38",
        r"C:\Program Files\Python311",
        r"C:\Program Files\Python310",
        r"C:\Program Files\Python39",
        r"C:\Program Files\Python38",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    dirs.extend([
        format!(r"C:\Users\{user}\AppData\Local\Programs\Python\Python311"),
        format!(r"C:\Users\{user}\AppData\Local\Programs\Python\Python310"),
        format!(r"C:\Users\{user}\AppData\Local\Microsoft\WindowsApps"),
    ]);
    dirs.extend(
        [
            r"C:\MinGW\bin",
            r"C:\msys64\mingw64\bin",
            r"C:\msys64\mingw32\bin",
            r"C:\msys64\ucrt64\bin",
            r"C:\TDM-GCC\bin",
            r"C:\Program Files\mingw-w64\x86_64-8.1.0-posix-seh-rt_v6-rev0\mingw64\bin",
            r"C:\Program Files (x86)\mingw-w64\i686-8.1.0-posix-dwarf-rt_v6-rev0\mingw32\bin",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    dirs
}

/// Only plain relative paths may be materialized; `..`, roots and drive
/// prefixes would escape the job directory.
fn safe_relative(name: &str) -> Option<PathBuf> {
    let p = Path::new(name);
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir       => {}
            _                       => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn sanitize(id: &str) -> String {
    let s: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    if s.is_empty() { "room".into() } else { s }
}

pub struct ExecutionEnvironment {
    root:     PathBuf,
    platform: Platform,
}

impl ExecutionEnvironment {
    pub fn new(root: impl Into<PathBuf>, platform: Platform) -> Self {
        Self { root: root.into(), platform }
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn venv_dir(&self) -> PathBuf { self.root.join(VENV_DIR) }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Directory name for a job: `<room>-<unix millis>-<job id>`.
    pub fn job_dir_name(room_id: &str, job_id: &str) -> String {
        format!("{}-{}-{}", sanitize(room_id), chrono::Utc::now().timestamp_millis(), job_id)
    }

    /// Creates a fresh job directory and writes every file into it. On any
    /// failure the partial directory is removed before returning.
    pub async fn prepare(&self, dir_name: &str, files: &[SourceFile]) -> Result<WorkDir, ExecError> {
        self.ensure_root().await?;
        let path = self.root.join(dir_name);
        fs::create_dir(&path).await?;
        let dir = WorkDir { path, removed: false };

        let written = write_all(dir.path(), files).await;
        if let Err(e) = written {
            dir.teardown().await;
            return Err(e);
        }
        Ok(dir)
    }

    /// PATH for discovery and for every spawned process. Windows hosts get the
    /// usual Python/MinGW install folders appended; elsewhere it is unchanged.
    pub fn augment_path(&self, base: Option<OsString>) -> OsString {
        let base = base.unwrap_or_default();
        if self.platform != Platform::Windows {
            return base;
        }
        let user = std::env::var("USERNAME").unwrap_or_default();
        let mut out = base;
        for dir in windows_tool_dirs(&user) {
            if !out.is_empty() {
                out.push(";");
            }
            out.push(dir);
        }
        out
    }
}

async fn write_all(root: &Path, files: &[SourceFile]) -> Result<(), ExecError> {
    for f in files {
        let rel = safe_relative(&f.name)
            .ok_or_else(|| ExecError::Environment(format!("refusing to write {:?}", f.name)))?;
        let target = root.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, f.content.as_bytes()).await?;
    }
    Ok(())
}

/// A job's scratch directory. Removed by `teardown`, or by `Drop` if the job
/// task unwinds before reaching it.
#[derive(Debug)]
pub struct WorkDir {
    path:    PathBuf,
    removed: bool,
}

impl WorkDir {
    pub fn path(&self) -> &Path { &self.path }

    pub async fn teardown(mut self) {
        self.removed = true;
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => tracing::debug!(dir = %self.path.display(), "work dir removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(dir = %self.path.display(), error = %e, "could not remove work dir"),
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.path.display(), error = %e, "could not remove work dir");
            }
        }
    }
}
