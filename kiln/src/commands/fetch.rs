//! `kiln fetch`

use super::build::{context, wait_interruptible};
use super::exit_status;
use convenient_ebuild::{KilnConfig, already_fetched};
use convenient_task::TaskHandle;

pub async fn run(config: &KilnConfig, check: bool) -> Result<i32, Box<dyn std::error::Error>> {
    let settings = config.build_settings().into_shared();

    if check {
        let fetched = already_fetched(&settings.distdir, &settings.distfiles).await;
        println!(
            "{}: {}",
            settings.package,
            if fetched { "all distfiles present" } else { "fetch needed" }
        );
        return Ok(if fetched { 0 } else { 1 });
    }

    let context = context(config)?;
    let handle = TaskHandle::spawn(context.fetch(settings));
    Ok(exit_status(wait_interruptible(&handle).await?))
}
