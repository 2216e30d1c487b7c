use convenient_ebuild::{
    BuildContext, BuildSettings, LockMode, PackageId, QueryHandler, StaticPackageDatabase,
    build_pipeline, entry_points,
};
use convenient_task::{InheritDescriptors, TaskHandle};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing_test::traced_test;

/// Phase script: `mutex` fails when two phases overlap in one build dir.
/// Each compile also appends the number of compiles running next to the
/// script to `concurrency`.
const SCRIPT: &str = r#"
case "$1" in
    clean) exit 0 ;;
    compile)
        mkdir "$KILN_BUILDDIR/mutex" || exit 9
        touch "${0%/*}/compiling.$$"
        sleep 0.3
        ls "${0%/*}" | grep -c '^compiling\.' >> "${0%/*}/concurrency"
        rm "${0%/*}/compiling.$$"
        rmdir "$KILN_BUILDDIR/mutex"
        ;;
    hang)
        trap '' TERM
        sleep 30
        ;;
esac
exec 3<>"$KILN_IPC_OUT"
printf '{"command":"exit","code":0}\n' > "$KILN_IPC_IN"
read -r reply <&3
"#;

fn settings(dir: &Path, phases: &[&str]) -> BuildSettings {
    let script = dir.join("build.sh");
    std::fs::write(&script, SCRIPT).unwrap();
    let mut settings = BuildSettings::new(PackageId::new("app-misc", "hello-1.0"), dir.join("build"));
    settings.phase_command = vec!["/bin/sh".into(), script.display().to_string()];
    settings.build_phases = phases.iter().map(|p| p.to_string()).collect();
    settings.distdir = dir.join("distfiles");
    settings.root = dir.join("root");
    settings.background = true;
    settings.exit_timeout = Duration::from_secs(2);
    settings.cancel_timeout = Duration::from_millis(200);
    settings
}

fn context() -> BuildContext {
    BuildContext::new(
        Arc::new(QueryHandler::new(Arc::new(StaticPackageDatabase::new()))),
        Arc::new(InheritDescriptors::new(entry_points())),
    )
}

#[tokio::test]
async fn test_supervisors_on_one_build_dir_are_serialized() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &["compile"]).into_shared();
    std::fs::create_dir_all(&settings.builddir).unwrap();
    let context = context();

    let started = Instant::now();
    let first = TaskHandle::spawn(context.phase(settings.clone(), "compile"));
    let second = TaskHandle::spawn(context.phase(settings.clone(), "compile"));

    assert_eq!(first.wait().await.unwrap(), 0);
    assert_eq!(second.wait().await.unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(600));
    let counts = std::fs::read_to_string(dir.path().join("concurrency")).unwrap();
    assert_eq!(counts, "1\n1\n");
}

#[tokio::test]
async fn test_non_blocking_lock_fails_fast() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &["compile"]).into_shared();
    std::fs::create_dir_all(&settings.builddir).unwrap();
    let context = context().with_lock_mode(LockMode::NonBlocking);

    let first = TaskHandle::spawn(context.phase(settings.clone(), "compile"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = TaskHandle::spawn(context.phase(settings.clone(), "compile"));

    assert_eq!(second.wait().await.unwrap(), 1);
    assert_eq!(first.wait().await.unwrap(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_cancelled_pipeline_waits_for_stubborn_phase() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &["hang", "install"]).into_shared();

    let pipeline = TaskHandle::spawn(build_pipeline(settings.clone(), &context()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let cancelled = Instant::now();
    pipeline.cancel();
    assert_eq!(pipeline.wait().await.unwrap(), -9);
    assert!(cancelled.elapsed() >= Duration::from_millis(200));
    assert!(logs_contain("sending SIGKILL"));

    assert!(!settings.lock_file().exists());
    assert!(!settings.imagedir().join("usr").exists());
}

#[tokio::test]
async fn test_pipelines_for_different_packages_run_side_by_side() {
    let dir = TempDir::new().unwrap();
    let context = context();

    let mut handles = Vec::new();
    for pf in ["hello-1.0", "world-2.0"] {
        let mut settings = settings(dir.path(), &["compile"]);
        settings.package = PackageId::new("app-misc", pf);
        settings.builddir = dir.path().join("build/app-misc").join(pf);
        handles.push(TaskHandle::spawn(build_pipeline(settings.into_shared(), &context)));
    }

    for handle in handles {
        assert_eq!(handle.wait().await.unwrap(), 0);
    }
    let counts = std::fs::read_to_string(dir.path().join("concurrency")).unwrap();
    assert!(counts.lines().any(|count| count.trim() == "2"), "{counts:?}");
}
