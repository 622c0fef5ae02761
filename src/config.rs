use std::{path::PathBuf, time::Duration};

use crate::error::AppErr;

/// Process-wide settings, read once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr:       String,
    pub port:            u16,
    pub temp_root:       PathBuf,
    pub run_timeout:     Duration,
    pub compile_timeout: Duration,
    pub install_timeout: Duration,
    pub production:      bool,
    pub sweep_interval:  Duration,
    pub stale_job_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr:       "0.0.0.0".into(),
            port:            5001,
            temp_root:       std::env::temp_dir().join("codecollab"),
            run_timeout:     Duration::from_secs(10),
            compile_timeout: Duration::from_secs(15),
            install_timeout: Duration::from_secs(30),
            production:      false,
            sweep_interval:  Duration::from_secs(60),
            stale_job_after: Duration::from_secs(600),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppErr> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, AppErr> {
        let mut cfg = Config::default();
        if let Some(v) = get("BIND_ADDR") { cfg.bind_addr = v; }
        if let Some(v) = get("PORT") {
            cfg.port = v.trim().parse().map_err(|_| AppErr::Config(format!("PORT={v} is not a port")))?;
        }
        if let Some(v) = get("CODEROOM_TEMP_DIR") { cfg.temp_root = PathBuf::from(v); }
        cfg.run_timeout     = secs(&get, "RUN_TIMEOUT_SECS", cfg.run_timeout)?;
        cfg.compile_timeout = secs(&get, "COMPILE_TIMEOUT_SECS", cfg.compile_timeout)?;
        cfg.install_timeout = secs(&get, "INSTALL_TIMEOUT_SECS", cfg.install_timeout)?;
        cfg.sweep_interval  = secs(&get, "SWEEP_INTERVAL_SECS", cfg.sweep_interval)?;
        cfg.stale_job_after = secs(&get, "STALE_JOB_SECS", cfg.stale_job_after)?;
        cfg.production = get("APP_ENV").is_some_and(|v| v.eq_ignore_ascii_case("production"));

        // the sweeper must never see a job directory that is still in use
        if cfg.stale_job_after <= cfg.longest_job() {
            return Err(AppErr::Config(format!(
                "STALE_JOB_SECS={} must exceed the longest possible job ({}s)",
                cfg.stale_job_after.as_secs(),
                cfg.longest_job().as_secs()
            )));
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String { format!("{}:{}", self.bind_addr, self.port) }

    /// Venv creation and dependency install each get the install budget.
    pub fn longest_job(&self) -> Duration {
        self.install_timeout * 2 + self.compile_timeout + self.run_timeout
    }
}

fn secs(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration, AppErr> {
    match get(key) {
        None => Ok(default),
        Some(v) => match v.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(AppErr::Config(format!("{key}={v} must be a positive number of seconds"))),
            Ok(n) => Ok(Duration::from_secs(n)),
        },
    }
}
