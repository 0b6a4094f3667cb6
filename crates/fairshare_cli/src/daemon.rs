//! Detaching into the background.

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

/// Flag removed from the relaunched command line
const DAEMON_FLAG: &str = "--daemon";

/// Command line of the background copy: the current one without `--daemon`
fn background_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter().filter(|arg| arg != DAEMON_FLAG).collect()
}

/// Re-run this program in a new process group with its output appended
/// to `log_file`, print the child's pid, and return
pub(crate) fn detach(log_file: &Path) -> Result<()> {
    let exe = std::env::current_exe().wrap_err("locating the fairshare executable")?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .wrap_err_with(|| format!("opening {}", log_file.display()))?;
    let child = Command::new(exe)
        .args(background_args(std::env::args_os().skip(1)))
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0)
        .spawn()
        .wrap_err("starting background process")?;
    println!("{}", child.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_flag_is_dropped() {
        let args = ["align", "--daemon", "--tasks", "t.txt"].map(OsString::from);
        assert_eq!(
            background_args(args),
            ["align", "--tasks", "t.txt"].map(OsString::from).to_vec()
        );
    }
}
