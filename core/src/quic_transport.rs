//! A concrete, real-socket [`Transport`] over QUIC (spec.md §1(a) leaves the
//! exact libp2p-style transport out of scope; this realizes the capability
//! for the reference CLI host). Generalizes the teacher's
//! `quic_transport.rs` `Connection`/`Listener`/`Transport` triad, and its
//! `self_signed_cert`/`make_server_endpoint` helpers, into the single
//! higher-level [`Transport`] trait this crate's C4–C8 layer is written
//! against: `send` opens one bidirectional stream per call, writes a
//! protocol-tagged framed message, and closes it — matching spec §4.4's
//! "opens a fresh stream on its protocol, writes one framed message, closes
//! the stream."
//!
//! Peer attribution for `get_connected_peers`/`on_peer_connected` is read
//! from the decoded envelope's `from` field rather than from a transport
//! handshake; the messenger layer already falls back to this per spec §4.4.

use crate::error::{Error, Result};
use crate::transport::{peer_id_of, MessageCallback, PeerCallback, Transport};
use async_trait::async_trait;
use quinn::{Endpoint, RecvStream, SendStream};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct QuicTransport {
    endpoint: Endpoint,
    self_weak: Mutex<Weak<QuicTransport>>,
    peer_addrs: Mutex<HashMap<String, SocketAddr>>,
    connected: Mutex<HashSet<String>>,
    handlers: Mutex<HashMap<String, Vec<MessageCallback>>>,
    on_connected: Mutex<Vec<PeerCallback>>,
    on_disconnected: Mutex<Vec<PeerCallback>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl QuicTransport {
    /// Binds a self-signed-cert QUIC endpoint on `bind_addr` that also
    /// dials out (trusting any peer certificate — identity is established
    /// at the application layer via the signed trust-request, not TLS).
    pub fn bind(bind_addr: SocketAddr) -> Result<Arc<Self>> {
        let endpoint = make_self_signed_endpoint(bind_addr)?;
        let transport = Arc::new(Self {
            endpoint,
            self_weak: Mutex::new(Weak::new()),
            peer_addrs: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            handlers: Mutex::new(HashMap::new()),
            on_connected: Mutex::new(Vec::new()),
            on_disconnected: Mutex::new(Vec::new()),
            accept_task: Mutex::new(None),
        });
        *transport.self_weak.lock().unwrap() = Arc::downgrade(&transport);
        Ok(transport)
    }

    /// Registers (or updates) the dialable address for a peer's device id.
    /// Call this from pairing/trust code once a peer's `multiaddrs` are
    /// known; `send` fails with `DialFailed` for unregistered peers.
    pub fn register_peer(&self, device_id: &str, addr: SocketAddr) {
        self.peer_addrs.lock().unwrap().insert(device_id.to_string(), addr);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().map_err(|e| Error::DialFailed(e.to_string()))
    }

    fn mark_connected(&self, peer: &str) {
        let inserted = self.connected.lock().unwrap().insert(peer.to_string());
        if inserted {
            for cb in self.on_connected.lock().unwrap().iter() {
                cb(peer.to_string());
            }
        }
    }

    fn dispatch(&self, protocol: &str, from: String, bytes: Vec<u8>) {
        self.mark_connected(&from);
        let handlers = self.handlers.lock().unwrap();
        if let Some(cbs) = handlers.get(protocol) {
            for cb in cbs {
                cb(from.clone(), bytes.clone());
            }
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            let Some(incoming) = self.endpoint.accept().await else { break };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.handle_incoming(incoming).await {
                    tracing::debug!(%err, "quic connection dropped");
                }
            });
        }
    }

    async fn handle_incoming(&self, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await.map_err(|e| Error::DialFailed(e.to_string()))?;
        let (_send, mut recv) = connection.accept_bi().await.map_err(|e| Error::StreamClosed.pair_with(e))?;
        let protocol = read_framed_string(&mut recv).await?;
        let body = read_framed_bytes(&mut recv).await?;

        let from = peer_id_from_body(&body).unwrap_or_else(|| "unknown".to_string());
        self.dispatch(&protocol, from, body);
        Ok(())
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn start(&self) -> Result<()> {
        let this = self.self_weak.lock().unwrap().upgrade().expect("QuicTransport must be held in an Arc");
        let handle = tokio::spawn(this.accept_loop());
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
        let peers: Vec<String> = self.connected.lock().unwrap().drain().collect();
        for peer in peers {
            for cb in self.on_disconnected.lock().unwrap().iter() {
                cb(peer.clone());
            }
        }
        Ok(())
    }

    async fn send(&self, protocol: &str, target: &str, bytes: Vec<u8>) -> Result<()> {
        let peer = peer_id_of(target).to_string();
        let addr = self
            .peer_addrs
            .lock()
            .unwrap()
            .get(&peer)
            .copied()
            .ok_or_else(|| Error::DialFailed(format!("no known address for {peer}")))?;

        let connection = self.endpoint.connect(addr, "localhost").map_err(|e| Error::DialFailed(e.to_string()))?;
        let connection = connection.await.map_err(|e| Error::DialFailed(e.to_string()))?;
        let (mut send, _recv) = connection.open_bi().await.map_err(|e| Error::DialFailed(e.to_string()))?;

        write_framed(&mut send, protocol.as_bytes()).await?;
        write_framed(&mut send, &bytes).await?;
        send.finish().ok();
        // Give the stream a chance to flush before dropping the connection
        // handle; quinn does not guarantee already-written bytes survive an
        // immediate drop.
        tokio::time::timeout(Duration::from_millis(500), connection.closed()).await.ok();

        self.mark_connected(&peer);
        Ok(())
    }

    fn on_message(&self, protocol: &str, cb: MessageCallback) {
        self.handlers.lock().unwrap().entry(protocol.to_string()).or_default().push(cb);
    }

    fn on_peer_connected(&self, cb: PeerCallback) {
        self.on_connected.lock().unwrap().push(cb);
    }

    fn on_peer_disconnected(&self, cb: PeerCallback) {
        self.on_disconnected.lock().unwrap().push(cb);
    }

    async fn get_connected_peers(&self) -> Vec<String> {
        self.connected.lock().unwrap().iter().cloned().collect()
    }
}

trait StreamClosedExt {
    fn pair_with(self, err: impl std::fmt::Display) -> Error;
}
impl StreamClosedExt for Error {
    fn pair_with(self, err: impl std::fmt::Display) -> Error {
        tracing::debug!(%err, "quic stream accept failed");
        self
    }
}

async fn read_framed_bytes(recv: &mut RecvStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await.map_err(|_| Error::StreamClosed)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::InvalidMessage(format!("frame of {len} bytes exceeds max")));
    }
    let mut buf = vec![0u8; len as usize];
    recv.read_exact(&mut buf).await.map_err(|_| Error::StreamClosed)?;
    Ok(buf)
}

async fn read_framed_string(recv: &mut RecvStream) -> Result<String> {
    let bytes = read_framed_bytes(recv).await?;
    String::from_utf8(bytes).map_err(|e| Error::InvalidMessage(e.to_string()))
}

async fn write_framed(send: &mut SendStream, bytes: &[u8]) -> Result<()> {
    send.write_all(&(bytes.len() as u32).to_be_bytes()).await.map_err(|e| Error::DialFailed(e.to_string()))?;
    send.write_all(bytes).await.map_err(|e| Error::DialFailed(e.to_string()))?;
    Ok(())
}

fn peer_id_from_body(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("from")?.as_str().map(str::to_string)
}

/// Self-signed certificate, ring crypto provider installed on first call.
fn self_signed_cert() -> Result<(rustls::pki_types::CertificateDer<'static>, rustls::pki_types::PrivateKeyDer<'static>)> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let kp = rcgen::KeyPair::generate().map_err(|e| Error::DialFailed(e.to_string()))?;
    let params = rcgen::CertificateParams::new(vec!["localhost".into()]).map_err(|e| Error::DialFailed(e.to_string()))?;
    let cert_pem = params.self_signed(&kp).map_err(|e| Error::DialFailed(e.to_string()))?;
    let cert_der = rustls::pki_types::CertificateDer::from(cert_pem.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(kp.serialize_der()));
    Ok((cert_der, key_der))
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Builds one endpoint that both serves (self-signed cert, no client auth)
/// and dials out (trusting any server cert — see module docs).
fn make_self_signed_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    let (cert, key) = self_signed_cert()?;

    let server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| Error::DialFailed(e.to_string()))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).map_err(|e| Error::DialFailed(e.to_string()))?,
    ));
    let mut transport_config = quinn::TransportConfig::default();
    transport_config.max_idle_timeout(Some(IDLE_TIMEOUT.try_into().map_err(|_| Error::DialFailed("bad idle timeout".into()))?));
    server_config.transport_config(Arc::new(transport_config));

    let mut endpoint = Endpoint::server(server_config, bind_addr).map_err(|e| Error::DialFailed(e.to_string()))?;

    let client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    let client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto).map_err(|e| Error::DialFailed(e.to_string()))?,
    ));
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}
