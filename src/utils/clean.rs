use std::{path::{Path, PathBuf}, time::Duration};
use tokio::{fs, time};

use crate::exec::workdir::VENV_DIR;

/// Periodically removes job directories a crashed or killed process left behind.
pub async fn task(root: PathBuf, every: Duration, stale_after: Duration) {
    let mut tick = time::interval(every);
    loop {
        tick.tick().await;
        let n = sweep(&root, stale_after).await;
        if n > 0 {
            tracing::info!(removed = n, root = %root.display(), "swept stale work dirs");
        }
    }
}

/// One pass; returns how many directories were deleted. The shared venv stays.
pub async fn sweep(root: &Path, stale_after: Duration) -> usize {
    let Ok(mut rd) = fs::read_dir(root).await else { return 0 };
    let mut removed = 0;
    while let Ok(Some(entry)) = rd.next_entry().await {
        if entry.file_name() == VENV_DIR {
            continue;
        }
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_dir() {
            continue;
        }
        let age = meta.modified().ok().and_then(|m| m.elapsed().ok()).unwrap_or_default();
        if age < stale_after {
            continue;
        }
        match fs::remove_dir_all(entry.path()).await {
            Ok(())  => removed += 1,
            Err(e)  => tracing::warn!(dir = %entry.path().display(), error = %e, "sweep failed"),
        }
    }
    removed
}
