//! `kiln config`

use convenient_ebuild::KilnConfig;
use std::path::Path;

pub async fn run(path: &Path) -> Result<i32, Box<dyn std::error::Error>> {
    let config = KilnConfig::load(path).await?;
    let settings = config.build_settings();

    print!("{}", serde_yaml::to_string(&config)?);
    println!("# builddir: {}", settings.builddir.display());
    println!("# lock file: {}", settings.lock_file().display());
    println!("# fork strategy: {:?}", config.run.fork_strategy());
    Ok(0)
}
