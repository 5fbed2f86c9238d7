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

//! `SIGTERM`/`SIGINT` request orderly shutdown; `SIGHUP` sets a reload
//! flag. These two atomics are the only process-wide mutable globals in
//! the system — installed here, read at well-defined points (before each
//! `accept`, between frames).

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{self, SigHandler, Signal};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_reload_signal(_: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn install() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_shutdown_signal))
            .context("Failed to install SIGTERM handler")?;
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_shutdown_signal))
            .context("Failed to install SIGINT handler")?;
        signal::signal(Signal::SIGHUP, SigHandler::Handler(handle_reload_signal))
            .context("Failed to install SIGHUP handler")?;
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Observes and clears the reload flag. The caller is responsible for
/// logging that a reload was requested; no config hot-reload is actually
/// performed (an explicit, recorded scope limit).
pub fn take_reload_requested() -> bool {
    RELOAD_REQUESTED.swap(false, Ordering::SeqCst)
}
