//! `kiln ipc`: the build-script side of the command channel
//!
//! Prints the reply's stdout and stderr and exits with its returncode, so
//! shell helpers can wrap it directly:
//!
//! ```sh
//! has_version() { kiln ipc has_version "${ROOT:-/}" "$1"; }
//! ```

use convenient_ebuild::{IpcClient, IpcCommand};
use std::io::{self, Write};

pub async fn run(args: &[String]) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(command) = IpcCommand::from_args(args) else {
        return Err(format!("invalid IPC command: {}", args.join(" ")).into());
    };
    let Some(client) = IpcClient::from_env() else {
        return Err("KILN_IPC_IN and KILN_IPC_OUT are not set; not running under kiln".into());
    };

    let reply = client.request(&command).await?;
    io::stdout().write_all(reply.stdout.as_bytes())?;
    io::stderr().write_all(reply.stderr.as_bytes())?;
    Ok(reply.returncode)
}
