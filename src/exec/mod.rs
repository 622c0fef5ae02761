//! Runs the active file of a room: resolve a toolchain, materialize the files,
//! install/compile as needed, run under a deadline, stream output, clean up.
pub mod process;
pub mod toolchain;
pub mod workdir;

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, OnceCell};
use tracing::Instrument;

use crate::{
    config::Config,
    error::{ExecError, RoomError},
    protocol::{OutputEvent, RunFile},
};
use process::run_bounded;
use toolchain::{CommandSpec, Language, PathProbe, Pipeline, Platform, Probe, Runnable, ToolchainResolver};
use workdir::{ExecutionEnvironment, WorkDir};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name:      String,
    pub content:   String,
    pub is_active: bool,
}

/// A validated `run-code` request: exactly one file is active.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub room_id: String,
    pub files:   Vec<SourceFile>,
    active:      usize,
}

impl ExecutionRequest {
    /// When no file carries the active flag, the one whose id matches
    /// `active_file_id` is taken instead.
    pub fn new(room_id: &str, files: Vec<RunFile>, active_file_id: Option<&str>) -> Result<Self, RoomError> {
        let mut flagged: Vec<usize> =
            files.iter().enumerate().filter(|(_, f)| f.is_active).map(|(i, _)| i).collect();
        if flagged.is_empty() {
            if let Some(want) = active_file_id {
                flagged.extend(files.iter().position(|f| f.id.as_deref() == Some(want)));
            }
        }
        let active = match flagged.as_slice() {
            [one] => *one,
            []    => return Err(RoomError::Protocol("No active file to run".into())),
            many  => {
                return Err(RoomError::Protocol(format!(
                    "Expected exactly one active file, got {}",
                    many.len()
                )))
            }
        };
        let files = files
            .into_iter()
            .enumerate()
            .map(|(i, f)| SourceFile { name: f.name, content: f.content, is_active: i == active })
            .collect();
        Ok(Self { room_id: room_id.to_owned(), files, active })
    }

    pub fn active(&self) -> &SourceFile { &self.files[self.active] }
}

/// Where a job's output goes. Called in order, from a single task.
pub trait OutputSink: Send + Sync {
    fn emit(&self, event: OutputEvent);
}

impl OutputSink for mpsc::UnboundedSender<OutputEvent> {
    fn emit(&self, event: OutputEvent) {
        let _ = self.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Preview,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    run:     Duration,
    compile: Duration,
    install: Duration,
}

pub struct ExecutionOrchestrator {
    env:      ExecutionEnvironment,
    resolver: ToolchainResolver,
    path:     OsString,
    platform: Platform,
    limits:   Limits,
    venv:     OnceCell<Option<PathBuf>>,
}

impl ExecutionOrchestrator {
    pub fn new(cfg: &Config) -> Self {
        let platform = Platform::current();
        let path = ExecutionEnvironment::new(&cfg.temp_root, platform)
            .augment_path(std::env::var_os("PATH"));
        Self::with_probe(cfg, Arc::new(PathProbe::new(path)))
    }

    pub fn with_probe(cfg: &Config, probe: Arc<dyn Probe>) -> Self {
        let platform = Platform::current();
        let env = ExecutionEnvironment::new(&cfg.temp_root, platform);
        let path = env.augment_path(std::env::var_os("PATH"));
        Self {
            env,
            resolver: ToolchainResolver::new(probe, platform, !cfg.production),
            path,
            platform,
            limits: Limits {
                run:     cfg.run_timeout,
                compile: cfg.compile_timeout,
                install: cfg.install_timeout,
            },
            venv: OnceCell::new(),
        }
    }

    pub fn environment(&self) -> &ExecutionEnvironment { &self.env }

    pub async fn run(&self, req: &ExecutionRequest, sink: &dyn OutputSink) -> JobOutcome {
        let job_id = nanoid::nanoid!(8);
        let span = tracing::info_span!("job", room = %req.room_id, job = %job_id, file = %req.active().name);
        self.run_job(req, &job_id, sink).instrument(span).await
    }

    async fn run_job(&self, req: &ExecutionRequest, job_id: &str, sink: &dyn OutputSink) -> JobOutcome {
        let pipeline = match self.resolver.resolve(req.active(), &req.files) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "nothing to run");
                sink.emit(e.to_event());
                return JobOutcome::Failed;
            }
        };
        let runnable = match pipeline {
            Pipeline::Run(r) => r,
            Pipeline::Preview => {
                sink.emit(OutputEvent::info("HTML/CSS/JS detected. Use the Preview button to view the result."));
                return JobOutcome::Preview;
            }
        };

        let dir_name = ExecutionEnvironment::job_dir_name(&req.room_id, job_id);
        let dir = match self.env.prepare(&dir_name, &req.files).await {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(error = %e, "could not prepare work dir");
                sink.emit(e.to_event());
                return JobOutcome::Failed;
            }
        };

        let outcome = match self.drive(&runnable, &req.files, &dir, sink).await {
            Ok(o) => o,
            Err(e) => {
                sink.emit(e.to_event());
                match e {
                    ExecError::TimedOut(_) => JobOutcome::TimedOut,
                    _                      => JobOutcome::Failed,
                }
            }
        };
        dir.teardown().await;
        tracing::info!(?outcome, "job finished");
        outcome
    }

    async fn drive(
        &self,
        runnable: &Runnable,
        files: &[SourceFile],
        dir: &WorkDir,
        sink: &dyn OutputSink,
    ) -> Result<JobOutcome, ExecError> {
        let program = match runnable {
            Runnable::Interpret { language: Language::Python, interpreter, entry } => {
                let python = self.python_for(interpreter, files, dir.path(), sink).await;
                CommandSpec::new(python).arg(entry.as_str())
            }
            Runnable::Interpret { interpreter, entry, .. } => {
                sink.emit(OutputEvent::info(format!("Using Node.js: {}", interpreter.display())));
                if files.iter().any(|f| f.name == "package.json") {
                    self.npm_install(interpreter, dir.path(), sink).await;
                }
                CommandSpec::new(interpreter.clone()).arg(entry.as_str())
            }
            Runnable::Compile { language, compiler, build, binary, entry, sources } => {
                if *sources > 1 {
                    sink.emit(OutputEvent::info(format!("Found {sources} source files. Compiling all...")));
                }
                sink.emit(OutputEvent::command(format!("Compiling {entry} with {compiler}...")));
                self.compile(build, dir.path(), sink).await?;
                sink.emit(OutputEvent::info(format!("Running compiled {} program...", language.label())));
                CommandSpec::new(dir.path().join(binary))
            }
        };
        self.execute(&program, dir.path(), sink).await
    }

    /* ------------ 安裝 ------------ */
    async fn python_for(&self, system: &Path, files: &[SourceFile], cwd: &Path, sink: &dyn OutputSink) -> PathBuf {
        if !files.iter().any(|f| f.name == "requirements.txt") {
            return system.to_path_buf();
        }
        let python = match self.venv_python(system, sink).await {
            Some(p) => {
                sink.emit(OutputEvent::info("Using Python virtual environment"));
                p
            }
            None => {
                sink.emit(OutputEvent::warning(
                    "Could not create virtual environment, using system Python instead.",
                ));
                system.to_path_buf()
            }
        };

        sink.emit(OutputEvent::command("Installing Python dependencies..."));
        let pip = CommandSpec::new(&python).arg("-m").arg("pip").arg("install").arg("-r").arg("requirements.txt");
        match self.install(&pip, cwd).await {
            Ok(())  => sink.emit(OutputEvent::success("Dependencies installed successfully.")),
            Err(e)  => sink.emit(e.to_event()),
        }
        python
    }

    /// Interpreter inside the host-wide venv, created on first use only.
    async fn venv_python(&self, system: &Path, sink: &dyn OutputSink) -> Option<PathBuf> {
        self.venv
            .get_or_init(|| async {
                let dir = self.env.venv_dir();
                let (python, pip) = venv_tools(&dir, self.platform);
                if is_file(&python).await && is_file(&pip).await {
                    return Some(python);
                }
                // a half-built venv (interrupted creation) has python but no pip
                if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                    tracing::warn!(dir = %dir.display(), "discarding incomplete virtual environment");
                    discard(&dir).await;
                }

                sink.emit(OutputEvent::info("Creating Python virtual environment (this may take a moment)..."));
                if let Err(e) = self.env.ensure_root().await {
                    tracing::warn!(error = %e, "cannot create temp root for venv");
                    return None;
                }
                let spec = CommandSpec::new(system).arg("-m").arg("venv").arg(dir.to_string_lossy());
                match run_bounded(&spec, self.env.root(), &self.path, self.limits.install).await {
                    Ok(Some(f)) if f.success() && is_file(&pip).await => Some(python),
                    other => {
                        tracing::warn!(result = ?other, "venv creation failed");
                        discard(&dir).await;
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn npm_install(&self, node: &Path, cwd: &Path, sink: &dyn OutputSink) {
        sink.emit(OutputEvent::command("Found package.json. Installing dependencies..."));
        let npm_name = match self.platform {
            Platform::Windows => "npm.cmd",
            Platform::Unix    => "npm",
        };
        let beside = node.parent().map(|d| d.join(npm_name)).filter(|p| p.is_file());
        let Some(npm) = beside.or_else(|| self.resolver.probe().find("npm")) else {
            sink.emit(ExecError::DependencyInstall("npm was not found".into()).to_event());
            return;
        };
        match self.install(&CommandSpec::new(npm).arg("install"), cwd).await {
            Ok(())  => sink.emit(OutputEvent::success("Dependencies installed successfully.")),
            Err(e)  => sink.emit(e.to_event()),
        }
    }

    async fn install(&self, spec: &CommandSpec, cwd: &Path) -> Result<(), ExecError> {
        tracing::debug!(cmd = %spec, "installing dependencies");
        match run_bounded(spec, cwd, &self.path, self.limits.install).await {
            Ok(Some(f)) if f.success() => Ok(()),
            Ok(Some(f)) => Err(ExecError::DependencyInstall(diagnostic(&f.stderr, &f.stdout, || f.exit_description()))),
            Ok(None) => Err(ExecError::DependencyInstall(format!(
                "timed out after {} seconds",
                self.limits.install.as_secs()
            ))),
            Err(e) => Err(ExecError::DependencyInstall(e.to_string())),
        }
    }

    /* ------------ 編譯 / 執行 ------------ */
    async fn compile(&self, build: &CommandSpec, cwd: &Path, sink: &dyn OutputSink) -> Result<(), ExecError> {
        tracing::debug!(cmd = %build, "compiling");
        let out = run_bounded(build, cwd, &self.path, self.limits.compile)
            .await
            .map_err(|e| ExecError::Compile(e.to_string()))?
            .ok_or_else(|| {
                ExecError::Compile(format!("compiler timed out after {} seconds", self.limits.compile.as_secs()))
            })?;
        if !out.success() {
            return Err(ExecError::Compile(diagnostic(&out.stderr, &out.stdout, || out.exit_description())));
        }
        if !out.stderr.trim().is_empty() {
            sink.emit(OutputEvent::warning(out.stderr.trim_end()));
        }
        sink.emit(OutputEvent::success("Compilation successful"));
        Ok(())
    }

    async fn execute(&self, program: &CommandSpec, cwd: &Path, sink: &dyn OutputSink) -> Result<JobOutcome, ExecError> {
        sink.emit(OutputEvent::command(format!("Executing: {program}")));
        let out = run_bounded(program, cwd, &self.path, self.limits.run)
            .await
            .map_err(|e| ExecError::Runtime(format!("Execution error: {e}")))?
            .ok_or(ExecError::TimedOut(self.limits.run))?;

        let mut quiet = true;
        for line in out.stdout.lines().filter(|l| !l.trim().is_empty()) {
            quiet = false;
            sink.emit(OutputEvent::output(line));
        }
        let stderr = out.stderr.trim_end();
        if !stderr.is_empty() {
            sink.emit(OutputEvent::error(stderr));
        } else if !out.success() {
            sink.emit(OutputEvent::error(out.exit_description()));
        } else if quiet {
            sink.emit(OutputEvent::success("Code executed successfully with no output"));
        }
        Ok(if out.success() { JobOutcome::Completed } else { JobOutcome::Failed })
    }
}

/// Interpreter and pip inside a venv.
fn venv_tools(dir: &Path, platform: Platform) -> (PathBuf, PathBuf) {
    match platform {
        Platform::Windows => (dir.join("Scripts").join("python.exe"), dir.join("Scripts").join("pip.exe")),
        Platform::Unix    => (dir.join("bin").join("python"), dir.join("bin").join("pip")),
    }
}

async fn is_file(p: &Path) -> bool {
    tokio::fs::metadata(p).await.map(|m| m.is_file()).unwrap_or(false)
}

async fn discard(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "cannot remove virtual environment"),
    }
}

/// stderr, else stdout, else the fallback.
fn diagnostic(stderr: &str, stdout: &str, fallback: impl FnOnce() -> String) -> String {
    [stderr.trim_end(), stdout.trim_end()]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(fallback)
}
