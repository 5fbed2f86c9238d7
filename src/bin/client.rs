//! Client entry point: loads config, applies CLI overrides, then uploads
//! each file in order, printing progress and preserving the first failure
//! while still attempting every remaining file.

// Unless we are in release mode, allow dead code, unused imports and variables,
// it makes development more enjoyable.
#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use structopt::clap::AppSettings;
use structopt::StructOpt;

use pixelgrade::config::ClientConfig;
use pixelgrade::protocol::ProcessingType;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "pixelgrade-client",
    setting = AppSettings::DeriveDisplayOrder,
    setting = AppSettings::ColoredHelp,
)]
struct Opts {
    /// Path to the JSON configuration file. Built-in defaults apply when absent.
    #[structopt(long)]
    config: Option<PathBuf>,

    /// Which pipeline(s) to run on the server for each upload.
    #[structopt(long, default_value = "both", possible_values = &["histogram", "color", "both"])]
    processing: String,

    /// Server host, overriding the config file.
    #[structopt(long)]
    host: Option<String>,

    /// Server port, overriding the config file.
    #[structopt(long)]
    port: Option<u16>,

    /// Connection scheme, overriding the config file.
    #[structopt(long, possible_values = &["http", "https"])]
    protocol: Option<String>,

    /// Upload chunk size in bytes, overriding the config file.
    #[structopt(long)]
    chunk_size: Option<usize>,

    /// Image files to upload, in order.
    #[structopt(required = true)]
    files: Vec<PathBuf>,
}

fn processing_type_from_str(s: &str) -> ProcessingType {
    match s {
        "histogram" => ProcessingType::Histogram,
        "color" => ProcessingType::Color,
        _ => ProcessingType::Both,
    }
}

fn main() {
    let opts = Opts::from_args();
    std::process::exit(run(opts));
}

fn run(opts: Opts) -> i32 {
    let mut config = match ClientConfig::load(opts.config.as_deref()).context("Failed to load configuration") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("pixelgrade-client: {:#}", e);
            return 1;
        }
    };
    if let Some(host) = opts.host {
        config.host = host;
    }
    if let Some(port) = opts.port {
        config.port = port;
    }
    if let Some(protocol) = opts.protocol {
        config.protocol = protocol;
    }
    if let Some(chunk_size) = opts.chunk_size {
        config.chunk_size = chunk_size;
    }

    let processing_type = processing_type_from_str(&opts.processing);
    let mut first_err: Option<anyhow::Error> = None;

    for path in &opts.files {
        let result = pixelgrade::client::upload_file(path, &config, processing_type, |message, progress| {
            println!("{}: {} ({:.0}%)", path.display(), message, progress * 100.0);
        });
        match result {
            Ok(image_id) => println!("{}: uploaded as {}", path.display(), image_id),
            Err(e) => {
                eprintln!("{}: failed: {:#}", path.display(), e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_err {
        eprintln!("pixelgrade-client: at least one upload failed: {:#}", e);
        1
    } else {
        0
    }
}
