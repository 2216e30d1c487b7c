//! `kiln build`

use super::exit_status;
use convenient_ebuild::{BuildContext, KilnConfig, QueryHandler, build_pipeline, entry_points};
use convenient_task::TaskHandle;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared run state for `config`
pub fn context(config: &KilnConfig) -> Result<BuildContext, Box<dyn std::error::Error>> {
    let strategy = config.run.fork_strategy().build(&entry_points())?;
    let queries = Arc::new(QueryHandler::new(Arc::new(config.database())));
    Ok(BuildContext::new(queries, strategy)
        .with_lock_mode(config.run.lock_mode)
        .with_fetch_jobs(config.run.max_fetch_jobs))
}

/// Wait for `handle`, cancelling it on Ctrl-C
pub async fn wait_interruptible(handle: &TaskHandle) -> Result<i32, Box<dyn std::error::Error>> {
    let returncode = tokio::select! {
        result = handle.wait() => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling '{}'", handle.name());
            handle.cancel();
            handle.wait().await?
        }
    };
    Ok(returncode)
}

pub async fn run(
    config: &KilnConfig,
    phase: Option<&str>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let settings = config.build_settings().into_shared();
    let context = context(config)?;

    let handle = match phase {
        Some(phase) => {
            info!("Running phase '{}' of {}", phase, settings.package);
            TaskHandle::spawn(context.phase(settings.clone(), phase))
        }
        None => {
            info!("Building {}", settings.package);
            TaskHandle::spawn(build_pipeline(settings.clone(), &context))
        }
    };

    let returncode = wait_interruptible(&handle).await?;
    if returncode == 0 {
        info!("{} done", handle.name());
    } else {
        warn!("{} failed with returncode {}", handle.name(), returncode);
    }
    Ok(exit_status(returncode))
}
