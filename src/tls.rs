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

//! TLS plumbing for the server (load cert/key from `tls_dir`, complete the
//! handshake eagerly so a bad client surfaces as "TLS handshake failed"
//! rather than being silently deferred to the first application read) and
//! for the client (connect with a verifier that accepts the server's
//! self-signed certificate unconditionally — see SPEC_FULL.md §9 for why).

use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::{Certificate, ClientConfig, ClientConnection, PrivateKey, ServerConfig, ServerConnection, ServerName};

pub type TlsServerStream = rustls::StreamOwned<ServerConnection, TcpStream>;
pub type TlsClientStream = rustls::StreamOwned<ClientConnection, TcpStream>;

pub fn load_server_config(tls_dir: &Path) -> Result<Arc<ServerConfig>> {
    let cert_path = tls_dir.join("server.crt");
    let key_path = tls_dir.join("server.key");
    let certs = load_certs(&cert_path)?;
    let key = load_private_key(&key_path)?;
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let raw = rustls_pemfile::certs(&mut reader)
        .with_context(|| format!("Failed to parse certificate(s) in {}", path.display()))?;
    if raw.is_empty() {
        bail!("No certificates found in {}", path.display());
    }
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let read_keys = |parser: fn(&mut dyn std::io::BufRead) -> std::io::Result<Vec<Vec<u8>>>| -> Result<Vec<Vec<u8>>> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);
        parser(&mut reader).with_context(|| format!("Failed to parse private key in {}", path.display()))
    };

    let mut keys = read_keys(rustls_pemfile::pkcs8_private_keys)?;
    if keys.is_empty() {
        keys = read_keys(rustls_pemfile::rsa_private_keys)?;
    }
    if keys.is_empty() {
        bail!("No private key found in {}", path.display());
    }
    Ok(PrivateKey(keys.remove(0)))
}

/// Wraps an accepted TCP socket in a TLS server session and drives the
/// handshake to completion immediately. A handshake failure (e.g. a plain
/// TCP client talking to a TLS-enabled server) is reported here rather than
/// deferred to the connection handler's first read.
pub fn accept(stream: TcpStream, config: Arc<ServerConfig>) -> Result<TlsServerStream> {
    let mut conn = ServerConnection::new(config).context("Failed to start TLS session")?;
    let mut sock = stream;
    conn.complete_io(&mut sock).context("TLS handshake failed")?;
    Ok(rustls::StreamOwned { conn, sock })
}

/// Accept-any-certificate verifier for the client's `https` mode. There is
/// no CA infrastructure in this deployment; the server presents a
/// self-signed certificate from its `tls_dir`.
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

pub fn client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Arc::new(config)
}

pub fn connect(stream: TcpStream, config: Arc<ClientConfig>, host: &str) -> Result<TlsClientStream> {
    let name = ServerName::try_from(host).with_context(|| format!("Invalid server name '{}'", host))?;
    let mut conn = ClientConnection::new(config, name).context("Failed to start TLS session")?;
    let mut sock = stream;
    conn.complete_io(&mut sock).context("TLS handshake failed")?;
    Ok(rustls::StreamOwned { conn, sock })
}
