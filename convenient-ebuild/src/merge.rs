//! Merging an image directory into the target root
//!
//! The merge runs in a child process through a [`ForkTask`] so a crash in
//! the copy cannot take the supervisor down.

use crate::settings::BuildSettings;
use convenient_task::{DescriptorStrategy, EntryPoints, ForkTarget, ForkTask};
use std::error::Error as StdError;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

/// Entry point name of [`merge_image`]
pub const MERGE_ENTRY: &str = "merge-image";

/// Entry points this crate runs in child processes
pub fn entry_points() -> EntryPoints {
    EntryPoints::new().register(MERGE_ENTRY, merge_image)
}

/// Counts of merged entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub dirs: usize,
    pub files: usize,
    pub symlinks: usize,
}

/// Copy the tree under `image` into `root`, keeping relative paths.
///
/// Existing files and symlinks in `root` are replaced; existing
/// directories are kept.
pub fn merge_tree(image: &Path, root: &Path) -> io::Result<MergeSummary> {
    let mut summary = MergeSummary::default();
    fs::create_dir_all(root)?;

    for entry in WalkDir::new(image).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(image)
            .map_err(io::Error::other)?;
        let target = root.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if !target.is_dir() {
                remove_existing(&target)?;
                fs::create_dir(&target)?;
                fs::set_permissions(&target, entry.metadata().map_err(io::Error::other)?.permissions())?;
            }
            summary.dirs += 1;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            remove_existing(&target)?;
            symlink(&link, &target)?;
            summary.symlinks += 1;
        } else {
            remove_existing(&target)?;
            fs::copy(entry.path(), &target)?;
            summary.files += 1;
        }
    }
    Ok(summary)
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Entry point: `merge-image <image> <root>`
pub fn merge_image(args: &[String]) -> Result<i32, Box<dyn StdError + Send + Sync>> {
    let [image, root] = args else {
        return Err(format!("expected <image> <root>, got {} argument(s)", args.len()).into());
    };
    let image = Path::new(image);
    if !image.is_dir() {
        return Err(format!("image directory {} does not exist", image.display()).into());
    }
    let summary = merge_tree(image, Path::new(root))?;
    writeln!(
        io::stdout(),
        ">>> Merged {} files, {} symlinks and {} directories into {}",
        summary.files,
        summary.symlinks,
        summary.dirs,
        root
    )?;
    Ok(0)
}

/// Merge stage of `settings`' package
pub fn merge_task(settings: &BuildSettings, strategy: Arc<dyn DescriptorStrategy>) -> ForkTask {
    let target = ForkTarget::new(
        MERGE_ENTRY,
        [
            settings.imagedir().display().to_string(),
            settings.root.display().to_string(),
        ],
    );
    let mut task = ForkTask::fork(format!("{} merge", settings.package), target, strategy);
    let spec = task.spec_mut();
    spec.background = settings.background;
    spec.log_path = settings.log_file.clone();
    spec.cancel_timeout = settings.cancel_timeout;
    spec.uid = settings.uid;
    spec.gid = settings.gid;
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_merge_tree() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("image");
        let root = dir.path().join("root");
        fs::create_dir_all(image.join("usr/bin")).unwrap();
        fs::create_dir_all(image.join("usr/share/doc/hello")).unwrap();
        fs::write(image.join("usr/bin/hello"), "#!/bin/sh\necho hello\n").unwrap();
        fs::write(image.join("usr/share/doc/hello/README"), "hi").unwrap();
        symlink("hello", image.join("usr/bin/hi")).unwrap();

        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/hello"), "old").unwrap();
        fs::write(root.join("usr/bin/other"), "keep").unwrap();

        let summary = merge_tree(&image, &root).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.symlinks, 1);
        assert_eq!(summary.dirs, 5);

        assert_eq!(
            fs::read_to_string(root.join("usr/bin/hello")).unwrap(),
            "#!/bin/sh\necho hello\n"
        );
        assert_eq!(fs::read_link(root.join("usr/bin/hi")).unwrap(), Path::new("hello"));
        assert_eq!(fs::read_to_string(root.join("usr/bin/other")).unwrap(), "keep");
        assert!(root.join("usr/share/doc/hello/README").is_file());
    }

    #[test]
    fn test_entry_point_arguments() {
        let dir = TempDir::new().unwrap();
        assert!(merge_image(&[]).is_err());
        assert!(merge_image(&[
            dir.path().join("missing").display().to_string(),
            dir.path().join("root").display().to_string(),
        ])
        .is_err());

        let entries = entry_points();
        assert!(entries.get(MERGE_ENTRY).is_some());
        assert_eq!(entries.invoke(MERGE_ENTRY, &["only-one".to_string()]), 1);
    }
}
