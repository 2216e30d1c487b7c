//! Descriptor transfer through a re-executed binary
//!
//! Runs without the libtest harness: the binary re-executes itself, and the
//! child side must reach `child_main` before anything else happens.

use convenient_task::{
    EntryPoints, ForkStrategy, ForkTarget, ForkTask, OutputMode, TaskHandle, child_main,
};
use std::error::Error;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;

fn write_marker(args: &[String]) -> Result<i32, Box<dyn Error + Send + Sync>> {
    writeln!(io::stdout(), "transferred {}", args.join(" "))?;
    Ok(3)
}

fn stdin_identity(_args: &[String]) -> Result<i32, Box<dyn Error + Send + Sync>> {
    writeln!(io::stdout(), "{}", describe_stdin()?)?;
    Ok(0)
}

fn describe_stdin() -> io::Result<String> {
    let meta = std::fs::metadata("/proc/self/fd/0")?;
    Ok(format!("{}:{}", meta.dev(), meta.ino()))
}

fn entries() -> EntryPoints {
    EntryPoints::new()
        .register("write-marker", write_marker)
        .register("stdin-identity", stdin_identity)
}

fn main() {
    let entries = entries();
    if let Some(code) = child_main(&entries) {
        std::process::exit(code);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("transfer.log");

        let strategy = ForkStrategy::Transfer.build(&entries).unwrap();
        let mut task = ForkTask::fork(
            "marker",
            ForkTarget::new("write-marker", ["a", "b"]),
            strategy,
        );
        task.spec_mut().background = true;
        task.spec_mut().output = OutputMode::Pipe;
        task.spec_mut().log_path = Some(log.clone());

        let handle = TaskHandle::spawn(task);
        assert_eq!(handle.wait().await.unwrap(), 3);
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "transferred a b\n"
        );

        // A foreground child shares our stdin, here a pipe rather than
        // /dev/null.
        let (stdin_read, _stdin_write) = nix::unistd::pipe().unwrap();
        // SAFETY: replaces fd 0 with a descriptor we own.
        assert!(unsafe { nix::libc::dup2(stdin_read.as_raw_fd(), 0) } >= 0);
        let expected = describe_stdin().unwrap();

        let log = dir.path().join("stdin.log");
        let strategy = ForkStrategy::Transfer.build(&entries).unwrap();
        let target = ForkTarget::new("stdin-identity", Vec::<String>::new());
        let mut task = ForkTask::fork("stdin", target, strategy);
        task.spec_mut().output = OutputMode::Pipe;
        task.spec_mut().log_path = Some(log.clone());

        let handle = TaskHandle::spawn(task);
        assert_eq!(handle.wait().await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), format!("{}\n", expected));
    });

    println!("test fork_transfer ... ok");
}
