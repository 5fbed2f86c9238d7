//! Shared scaffolding for the end-to-end protocol tests: a loopback server
//! bootstrapped from a fresh `ServerConfig` pointed at a `tempfile` tree,
//! plus small in-memory image builders so tests don't need fixture files
//! on disk.

use std::io::Cursor;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use image::{ImageEncoder, Rgb, RgbImage};
use tempfile::TempDir;

use pixelgrade::config::ServerConfig;
use pixelgrade::logging::Logger;
use pixelgrade::scheduler::Scheduler;
use pixelgrade::transport::Connection;

/// A self-signed certificate/key pair for localhost, used only by the TLS
/// handshake-failure test; generated once with `openssl req -x509
/// -newkey rsa:2048 -nodes` and not tied to any real deployment.
pub const TEST_TLS_CERT_PEM: &str = include_str!("test_cert.pem");
pub const TEST_TLS_KEY_PEM: &str = include_str!("test_key.pem");

pub struct TestServer {
    pub addr: SocketAddr,
    pub histogram_dir: PathBuf,
    pub colors_red_dir: PathBuf,
    pub colors_green_dir: PathBuf,
    pub colors_blue_dir: PathBuf,
    pub log_file: PathBuf,
    scheduler: Arc<Scheduler>,
    _tmp: TempDir,
}

impl TestServer {
    /// Binds a loopback listener, starts the scheduler, and spawns one
    /// thread per accepted connection running the real `connection::handle`
    /// state machine -- the same code path the production binary runs.
    pub fn start() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let config = ServerConfig {
            port: 0,
            tls_enabled: false,
            tls_dir: tmp.path().join("tls"),
            log_file: tmp.path().join("log.txt"),
            histogram_dir: tmp.path().join("histogram"),
            colors_red_dir: tmp.path().join("colors/red"),
            colors_green_dir: tmp.path().join("colors/green"),
            colors_blue_dir: tmp.path().join("colors/blue"),
            connection_timeout_secs: 5,
            max_image_size: 256 * 1024 * 1024,
        };
        config.ensure_directories()?;

        let logger = Logger::open(&config.log_file)?;
        let scheduler = Arc::new(Scheduler::start(config.output_config(), logger.clone())?);

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        let server = TestServer {
            addr,
            histogram_dir: config.histogram_dir.clone(),
            colors_red_dir: config.colors_red_dir.clone(),
            colors_green_dir: config.colors_green_dir.clone(),
            colors_blue_dir: config.colors_blue_dir.clone(),
            log_file: config.log_file.clone(),
            scheduler: scheduler.clone(),
            _tmp: tmp,
        };

        thread::spawn(move || {
            for incoming in listener.incoming() {
                let Ok(socket) = incoming else { return };
                let config = config.clone();
                let scheduler = scheduler.clone();
                let logger = logger.clone();
                thread::spawn(move || {
                    let conn = Connection::Plain(socket);
                    pixelgrade::connection::handle(conn, &config, &scheduler, &logger);
                });
            }
        });

        Ok(server)
    }

    /// Blocks until the scheduler has fully drained and processed every job
    /// enqueued so far. Safe to call once per test, at the point all
    /// uploads have received their ACK.
    pub fn drain(&self) {
        self.scheduler.shutdown();
    }

    pub fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr)?)
    }

    /// Same as `start`, but with TLS enabled using the bundled self-signed
    /// test certificate. Mirrors the accept loop's TLS branch in the
    /// `pixelgrade-server` binary: a handshake failure is logged and the
    /// connection dropped without ever reaching `connection::handle`.
    pub fn start_tls() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let tls_dir = tmp.path().join("tls");
        std::fs::create_dir_all(&tls_dir)?;
        std::fs::write(tls_dir.join("server.crt"), TEST_TLS_CERT_PEM)?;
        std::fs::write(tls_dir.join("server.key"), TEST_TLS_KEY_PEM)?;

        let config = ServerConfig {
            port: 0,
            tls_enabled: true,
            tls_dir,
            log_file: tmp.path().join("log.txt"),
            histogram_dir: tmp.path().join("histogram"),
            colors_red_dir: tmp.path().join("colors/red"),
            colors_green_dir: tmp.path().join("colors/green"),
            colors_blue_dir: tmp.path().join("colors/blue"),
            connection_timeout_secs: 5,
            max_image_size: 256 * 1024 * 1024,
        };
        config.ensure_directories()?;

        let tls_config = pixelgrade::tls::load_server_config(&config.tls_dir)?;
        let logger = Logger::open(&config.log_file)?;
        let scheduler = Arc::new(Scheduler::start(config.output_config(), logger.clone())?);

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        let server = TestServer {
            addr,
            histogram_dir: config.histogram_dir.clone(),
            colors_red_dir: config.colors_red_dir.clone(),
            colors_green_dir: config.colors_green_dir.clone(),
            colors_blue_dir: config.colors_blue_dir.clone(),
            log_file: config.log_file.clone(),
            scheduler: scheduler.clone(),
            _tmp: tmp,
        };

        thread::spawn(move || {
            for incoming in listener.incoming() {
                let Ok(socket) = incoming else { return };
                let config = config.clone();
                let scheduler = scheduler.clone();
                let logger = logger.clone();
                let tls_config = tls_config.clone();
                thread::spawn(move || match pixelgrade::tls::accept(socket, tls_config) {
                    Ok(stream) => {
                        let conn = Connection::Tls(Box::new(stream));
                        pixelgrade::connection::handle(conn, &config, &scheduler, &logger);
                    }
                    Err(e) => {
                        logger.log(&format!("TLS handshake failed: {:#}", e));
                    }
                });
            }
        });

        Ok(server)
    }
}

pub fn png_bytes(w: u32, h: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(w, h, Rgb(color));
    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out)
        .write_image(&img, w, h, image::ColorType::Rgb8.into())
        .unwrap();
    out
}

/// Builds a tiny animated GIF with the given per-frame delays, stored
/// verbatim in the Graphic Control Extension -- in whatever unit the
/// caller intends, centiseconds or mislabeled milliseconds.
pub fn gif_bytes(w: u16, h: u16, frame_colors: &[[u8; 4]], delays: &[u16]) -> Vec<u8> {
    assert_eq!(frame_colors.len(), delays.len());
    let mut out = Vec::new();
    {
        let mut encoder = gif::Encoder::new(&mut out, w, h, &[]).unwrap();
        encoder.set_repeat(gif::Repeat::Infinite).unwrap();
        for (&color, &delay) in frame_colors.iter().zip(delays) {
            let mut rgba: Vec<u8> = Vec::with_capacity(w as usize * h as usize * 4);
            for _ in 0..(w as usize * h as usize) {
                rgba.extend_from_slice(&color);
            }
            let mut frame = gif::Frame::from_rgba_speed(w, h, &mut rgba, 10);
            frame.delay = delay;
            encoder.write_frame(&frame).unwrap();
        }
    }
    out
}

pub fn decode_gif(bytes: &[u8]) -> (u16, u16, Vec<u16>, usize) {
    let mut options = gif::DecodeOptions::new();
    options.set_color_output(gif::ColorOutput::RGBA);
    let mut decoder = options.read_info(Cursor::new(bytes)).unwrap();
    let w = decoder.width();
    let h = decoder.height();
    let mut delays = Vec::new();
    let mut count = 0;
    while let Some(frame) = decoder.read_next_frame().unwrap() {
        delays.push(frame.delay);
        count += 1;
    }
    (w, h, delays, count)
}

pub fn dir_file_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

pub fn dir_single_file(dir: &std::path::Path) -> PathBuf {
    let mut entries: Vec<_> = std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(entries.len(), 1, "expected exactly one file in {}", dir.display());
    entries.remove(0)
}
