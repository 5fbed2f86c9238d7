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

//! A line-oriented, thread-safe log sink: each call appends one
//! `[YYYY-MM-DD HH:MM:SS] message` line and flushes immediately so a crash
//! doesn't lose the tail of the log. The core treats this as a black box;
//! it does not interpret or route by level.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Local;

struct Inner {
    writer: Mutex<BufWriter<File>>,
}

#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        Ok(Logger { inner: Arc::new(Inner { writer: Mutex::new(BufWriter::new(file)) }) })
    }

    /// Each call is atomic with respect to other calls: the line is
    /// formatted and written while holding the sink's single lock.
    pub fn log(&self, message: &str) {
        let line = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        let mut writer = self.inner.writer.lock().unwrap();
        let _ = writer.write_all(line.as_bytes());
        let _ = writer.flush();
    }
}
