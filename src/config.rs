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

//! `ServerConfig`/`ClientConfig` loaded from a JSON file, matching the
//! original server's `{"server": {...}, "paths": {...}}` shape and the
//! client's flat connection-settings object.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::protocol::DEFAULT_CHUNK_SIZE;

fn default_port() -> u16 { crate::protocol::DEFAULT_PORT }
fn default_false() -> bool { false }
fn default_tls_dir() -> PathBuf { PathBuf::from("assets/tls") }
fn default_log_file() -> PathBuf { PathBuf::from("assets/log.txt") }
fn default_histogram_dir() -> PathBuf { PathBuf::from("assets/histogram") }
fn default_colors_dir(channel: &str) -> PathBuf { PathBuf::from(format!("assets/colors/{}", channel)) }
fn default_colors_red() -> PathBuf { default_colors_dir("red") }
fn default_colors_green() -> PathBuf { default_colors_dir("green") }
fn default_colors_blue() -> PathBuf { default_colors_dir("blue") }
fn default_connection_timeout_secs() -> u64 { 15 }
fn default_max_image_size() -> u32 { 256 * 1024 * 1024 }

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_false")]
    tls_enabled: bool,
    #[serde(default = "default_tls_dir")]
    tls_dir: PathBuf,
    #[serde(default = "default_connection_timeout_secs")]
    connection_timeout_secs: u64,
    #[serde(default = "default_max_image_size")]
    max_image_size: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            port: default_port(),
            tls_enabled: default_false(),
            tls_dir: default_tls_dir(),
            connection_timeout_secs: default_connection_timeout_secs(),
            max_image_size: default_max_image_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ColorsDirSection {
    #[serde(default = "default_colors_red")]
    red: PathBuf,
    #[serde(default = "default_colors_green")]
    green: PathBuf,
    #[serde(default = "default_colors_blue")]
    blue: PathBuf,
}

impl Default for ColorsDirSection {
    fn default() -> Self {
        ColorsDirSection { red: default_colors_red(), green: default_colors_green(), blue: default_colors_blue() }
    }
}

#[derive(Debug, Deserialize)]
struct PathsSection {
    #[serde(default = "default_log_file")]
    log_file: PathBuf,
    #[serde(default = "default_histogram_dir")]
    histogram_dir: PathBuf,
    #[serde(default)]
    colors_dir: ColorsDirSection,
}

impl Default for PathsSection {
    fn default() -> Self {
        PathsSection {
            log_file: default_log_file(),
            histogram_dir: default_histogram_dir(),
            colors_dir: ColorsDirSection::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawServerConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    paths: PathsSection,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_dir: PathBuf,
    pub log_file: PathBuf,
    pub histogram_dir: PathBuf,
    pub colors_red_dir: PathBuf,
    pub colors_green_dir: PathBuf,
    pub colors_blue_dir: PathBuf,
    pub connection_timeout_secs: u64,
    pub max_image_size: u32,
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let raw: RawServerConfig = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => RawServerConfig::default(),
        };

        Ok(ServerConfig {
            port: raw.server.port,
            tls_enabled: raw.server.tls_enabled,
            tls_dir: raw.server.tls_dir,
            log_file: raw.paths.log_file,
            histogram_dir: raw.paths.histogram_dir,
            colors_red_dir: raw.paths.colors_dir.red,
            colors_green_dir: raw.paths.colors_dir.green,
            colors_blue_dir: raw.paths.colors_dir.blue,
            connection_timeout_secs: raw.server.connection_timeout_secs,
            max_image_size: raw.server.max_image_size,
        })
    }

    /// All four output directories must exist before the server begins
    /// accepting; the log file's parent and the TLS directory (when TLS is
    /// enabled) must also be writable. Fatal at startup on failure.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.histogram_dir, &self.colors_red_dir, &self.colors_green_dir, &self.colors_blue_dir] {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        if let Some(parent) = self.log_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
        }
        if self.tls_enabled {
            fs::create_dir_all(&self.tls_dir)
                .with_context(|| format!("Failed to create directory {}", self.tls_dir.display()))?;
        }
        Ok(())
    }

    pub fn output_config(&self) -> crate::processor::OutputConfig {
        crate::processor::OutputConfig {
            histogram_dir: self.histogram_dir.clone(),
            color_red_dir: self.colors_red_dir.clone(),
            color_green_dir: self.colors_green_dir.clone(),
            color_blue_dir: self.colors_blue_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_protocol() -> String { "http".to_string() }
fn default_chunk_size() -> usize { DEFAULT_CHUNK_SIZE }
fn default_connect_timeout() -> u64 { 10 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 500 }

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: default_host(),
            port: default_port(),
            protocol: default_protocol(),
            chunk_size: default_chunk_size(),
            connect_timeout: default_connect_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))
            }
            None => Ok(ClientConfig::default()),
        }
    }

    pub fn wants_tls(&self) -> Result<bool> {
        match self.protocol.as_str() {
            "http" => Ok(false),
            "https" => Ok(true),
            other => bail!("Unknown protocol '{}': expected 'http' or 'https'", other),
        }
    }
}
