//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Double-fork daemonization and pidfile handling, the way the original
//! server's daemon sequence does it: fork, let the first parent exit,
//! `setsid` in the child, fork again so the daemon can never reacquire a
//! controlling terminal, redirect stdio to `/dev/null`, then write the
//! pidfile from the final process.

use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::{self, ForkResult};

pub fn daemonize() -> Result<()> {
    // First fork: detach from the invoking shell's process group.
    match unsafe { unistd::fork() }.context("Failed to fork (stage 1)")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    unistd::setsid().context("Failed to start a new session")?;

    // Second fork: a session leader can still acquire a controlling
    // terminal; forking again and letting the session leader exit
    // prevents that.
    match unsafe { unistd::fork() }.context("Failed to fork (stage 2)")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_stdio_to_devnull().context("Failed to redirect stdio to /dev/null")?;
    Ok(())
}

fn redirect_stdio_to_devnull() -> Result<()> {
    let devnull = File::open("/dev/null").context("Failed to open /dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        unsafe {
            if libc::dup2(fd, target) < 0 {
                return Err(std::io::Error::last_os_error()).context("dup2 to /dev/null failed");
            }
        }
    }
    Ok(())
}

pub fn write_pidfile(path: &Path) -> Result<()> {
    let pid = std::process::id();
    let mut file = File::create(path).with_context(|| format!("Failed to create pidfile {}", path.display()))?;
    writeln!(file, "{}", pid).with_context(|| format!("Failed to write pidfile {}", path.display()))
}
