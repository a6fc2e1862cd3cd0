use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use openclipboard::{default_history_path, default_identity_path, default_trust_path, preview};
use openclipboard_core::clipboard::{ClipboardIo, ManualClipboard};
use openclipboard_core::history::ClipHistoryStore;
use openclipboard_core::history_sync::HistorySyncController;
use openclipboard_core::identity::{now_ms, IdentityService};
use openclipboard_core::messenger::{ProtocolMessenger, TrustedMessenger};
use openclipboard_core::pairing::PairingPayload;
use openclipboard_core::protocol::{SyncMessage, CLIP_PROTOCOL, HISTORY_PROTOCOL, TRUST_PROTOCOL};
use openclipboard_core::quic_transport::QuicTransport;
use openclipboard_core::registry::PeerRegistry;
use openclipboard_core::store::FileKvStore;
use openclipboard_core::sync::ClipboardSyncController;
use openclipboard_core::transport::Transport;
use openclipboard_core::trust::{TrustEvent, TrustManager, TrustMessenger, TrustedDevice};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "openclipboard", version, about = "Peer-to-peer clipboard sync CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(name = "id:new")]
    IdNew {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    #[command(name = "id:show")]
    IdShow {
        #[arg(long)]
        path: Option<PathBuf>,
    },

    #[command(name = "pair:init")]
    PairInit {
        #[arg(long)]
        name: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        id_path: Option<PathBuf>,
    },

    #[command(name = "pair:respond")]
    PairRespond {
        /// Encoded pairing payload printed by the peer's `pair:init`.
        #[arg(long)]
        payload: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        id_path: Option<PathBuf>,
        #[arg(long)]
        trust_path: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },

    #[command(name = "pair:finalize")]
    PairFinalize {
        #[arg(long)]
        name: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        id_path: Option<PathBuf>,
        #[arg(long)]
        trust_path: Option<PathBuf>,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    #[command(name = "serve")]
    Serve {
        #[arg(long)]
        name: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        id_path: Option<PathBuf>,
        #[arg(long)]
        trust_path: Option<PathBuf>,
        #[arg(long)]
        history_path: Option<PathBuf>,
    },

    #[command(name = "send:text")]
    SendText {
        #[arg(long)]
        to: String,
        #[arg(long)]
        text: String,
        #[arg(long)]
        id_path: Option<PathBuf>,
        #[arg(long)]
        trust_path: Option<PathBuf>,
    },
}

/// Binds the trust manager's messenger requirement to a `/clipboard/trust/1.0.0`
/// [`ProtocolMessenger`], addressing peers by device id (the transport resolves
/// the dialable address via `register_peer`).
struct QuicTrustMessenger {
    inner: Arc<ProtocolMessenger>,
}

#[async_trait]
impl TrustMessenger for QuicTrustMessenger {
    async fn send(&self, target: &TrustedDevice, msg: SyncMessage) -> openclipboard_core::Result<()> {
        self.inner.send(&target.device_id, &msg).await
    }
}

/// Parses a `/ip4/<addr>/udp/<port>/quic/p2p/<id>` multiaddr into the
/// `SocketAddr` the QUIC transport dials.
fn multiaddr_socket_addr(multiaddr: &str) -> Option<SocketAddr> {
    let parts: Vec<&str> = multiaddr.split('/').filter(|s| !s.is_empty()).collect();
    let mut ip = None;
    let mut port = None;
    let mut i = 0;
    while i + 1 < parts.len() {
        match parts[i] {
            "ip4" | "ip6" => ip = Some(parts[i + 1]),
            "udp" | "tcp" => port = parts[i + 1].parse::<u16>().ok(),
            _ => {}
        }
        i += 2;
    }
    format!("{}:{}", ip?, port?).parse().ok()
}

fn local_multiaddr(port: u16, device_id: &str) -> String {
    format!("/ip4/127.0.0.1/udp/{port}/quic/p2p/{device_id}")
}

fn register_device_addr(transport: &QuicTransport, device: &TrustedDevice) {
    let Some(addr) = device.multiaddrs.iter().find_map(|a| multiaddr_socket_addr(a)) else {
        tracing::warn!(device_id = %device.device_id, "no dialable address in device's multiaddrs");
        return;
    };
    transport.register_peer(&device.device_id, addr);
}

fn load_or_create_identity(path: &std::path::Path) -> Result<Arc<IdentityService<FileKvStore>>> {
    let store = FileKvStore::new(path.to_path_buf()).with_context(|| format!("open identity store {}", path.display()))?;
    Ok(Arc::new(IdentityService::new(store)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::IdNew { name, path } => {
            let path = path.unwrap_or_else(default_identity_path);
            let identity = load_or_create_identity(&path)?;
            let mut view = identity.get()?;
            if let Some(name) = name {
                view = identity.rename(&name)?;
            }
            println!("wrote identity: {}", path.display());
            println!("device_id: {}", view.device_id);
            println!("device_name: {}", view.device_name);
        }
        Command::IdShow { path } => {
            let path = path.unwrap_or_else(default_identity_path);
            if !path.exists() {
                bail!("no identity at {} — run id:new first", path.display());
            }
            let identity = load_or_create_identity(&path)?;
            let view = identity.get()?;
            println!("device_id: {}", view.device_id);
            println!("device_name: {}", view.device_name);
            println!("multiaddrs: {:?}", view.multiaddrs);
        }
        Command::PairInit { name, port, id_path } => {
            let id_path = id_path.unwrap_or_else(default_identity_path);
            let identity = load_or_create_identity(&id_path)?;
            identity.rename(&name)?;
            let view = identity.get()?;
            let multiaddr = local_multiaddr(port, &view.device_id);
            identity.update_multiaddrs(vec![multiaddr])?;

            let view = identity.get()?;
            let payload = PairingPayload {
                device_id: view.device_id.clone(),
                device_name: view.device_name.clone(),
                public_key: view.public_key.clone(),
                multiaddrs: view.multiaddrs.clone(),
                timestamp: now_ms() / 1000,
                version: "1".to_string(),
            };
            println!("{}", payload.encode());
            eprintln!("share this payload with the peer running pair:respond");
        }
        Command::PairRespond { payload, name, port, id_path, trust_path, timeout_secs } => {
            let peer_payload = PairingPayload::decode_checked(&payload)?;

            let id_path = id_path.unwrap_or_else(default_identity_path);
            let trust_path = trust_path.unwrap_or_else(default_trust_path);
            let identity = load_or_create_identity(&id_path)?;
            identity.rename(&name)?;
            let local = identity.get()?;
            identity.update_multiaddrs(vec![local_multiaddr(port, &local.device_id)])?;

            let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
            let transport = QuicTransport::bind(bind_addr)?;
            transport.start().await?;

            let peer_device = TrustedDevice {
                device_id: peer_payload.device_id.clone(),
                device_name: peer_payload.device_name.clone(),
                public_key: peer_payload.public_key.clone(),
                multiaddrs: peer_payload.multiaddrs.clone(),
                created_at: peer_payload.timestamp * 1000,
                last_seen: None,
            };
            register_device_addr(&transport, &peer_device);

            let trust_store = FileKvStore::new(trust_path.clone())?;
            let trust_manager = TrustManager::new(identity.clone(), trust_store);

            let raw_messenger = ProtocolMessenger::new(TRUST_PROTOCOL, transport.clone());
            let tm_for_dispatch = trust_manager.clone();
            raw_messenger.on_message(Box::new(move |msg| {
                let tm = tm_for_dispatch.clone();
                tokio::spawn(async move {
                    if let Err(err) = tm.handle_trust_message(msg).await {
                        tracing::warn!(%err, "failed to handle trust message");
                    }
                });
            }));
            trust_manager.bind_messenger(Arc::new(QuicTrustMessenger { inner: raw_messenger }));

            let approved = Arc::new(Notify::new());
            let approved_for_listener = approved.clone();
            trust_manager.on(TrustEvent::Approved, Box::new(move |_| approved_for_listener.notify_one()));

            trust_manager.send_trust_request(&peer_device).await?;
            println!("sent trust-request to {} ({})", peer_device.device_name, peer_device.device_id);

            let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), approved.notified()).await;
            match outcome {
                Ok(()) => println!("paired: {} now trusted", peer_device.device_id),
                Err(_) => println!(
                    "no ack within {timeout_secs}s; ask the peer to run pair:finalize to accept your request"
                ),
            }

            trust_manager.stop();
            transport.stop().await.ok();
        }
        Command::PairFinalize { name, port, id_path, trust_path, timeout_secs } => {
            let id_path = id_path.unwrap_or_else(default_identity_path);
            let trust_path = trust_path.unwrap_or_else(default_trust_path);
            let identity = load_or_create_identity(&id_path)?;
            identity.rename(&name)?;
            let local = identity.get()?;
            identity.update_multiaddrs(vec![local_multiaddr(port, &local.device_id)])?;

            let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
            let transport = QuicTransport::bind(bind_addr)?;
            transport.start().await?;

            let trust_store = FileKvStore::new(trust_path.clone())?;
            let trust_manager = TrustManager::new(identity.clone(), trust_store);

            let raw_messenger = ProtocolMessenger::new(TRUST_PROTOCOL, transport.clone());
            let tm_for_dispatch = trust_manager.clone();
            raw_messenger.on_message(Box::new(move |msg| {
                let tm = tm_for_dispatch.clone();
                tokio::spawn(async move {
                    if let Err(err) = tm.handle_trust_message(msg).await {
                        tracing::warn!(%err, "failed to handle trust message");
                    }
                });
            }));
            trust_manager.bind_messenger(Arc::new(QuicTrustMessenger { inner: raw_messenger }));

            let requested = Arc::new(Notify::new());
            let requested_for_listener = requested.clone();
            let pending_device: Arc<std::sync::Mutex<Option<TrustedDevice>>> = Arc::new(std::sync::Mutex::new(None));
            let pending_for_listener = pending_device.clone();
            trust_manager.on(
                TrustEvent::Request,
                Box::new(move |device| {
                    *pending_for_listener.lock().unwrap() = Some(device);
                    requested_for_listener.notify_one();
                }),
            );

            println!("listening on port {port} for a trust-request ({timeout_secs}s timeout)...");
            if tokio::time::timeout(Duration::from_secs(timeout_secs), requested.notified()).await.is_err() {
                println!("no trust-request received within {timeout_secs}s");
                trust_manager.stop();
                transport.stop().await.ok();
                return Ok(());
            }

            let device = pending_device.lock().unwrap().clone().expect("notified implies a pending device was recorded");
            println!("trust-request from {} ({})", device.device_name, device.device_id);
            print!("accept? [y/N]: ");
            use std::io::Write as _;
            std::io::stdout().flush().ok();
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            let accept = line.trim().eq_ignore_ascii_case("y");

            trust_manager.send_trust_ack(&device.device_id, accept).await?;
            println!("{}", if accept { "accepted" } else { "rejected" });

            trust_manager.stop();
            transport.stop().await.ok();
        }
        Command::Serve { name, port, id_path, trust_path, history_path } => {
            run_serve(name, port, id_path, trust_path, history_path).await?
        }
        Command::SendText { to, text, id_path, trust_path } => {
            let id_path = id_path.unwrap_or_else(default_identity_path);
            let trust_path = trust_path.unwrap_or_else(default_trust_path);
            let identity = load_or_create_identity(&id_path)?;
            let local = identity.get()?;

            let trust_store = FileKvStore::new(trust_path.clone())?;
            let trust_manager = TrustManager::new(identity.clone(), trust_store);
            let target_device = trust_manager
                .list()
                .into_iter()
                .find(|d| d.device_id == to)
                .with_context(|| format!("{to} is not a trusted device — pair first"))?;

            let bind_addr: SocketAddr = "0.0.0.0:0".parse()?;
            let transport = QuicTransport::bind(bind_addr)?;
            transport.start().await?;
            register_device_addr(&transport, &target_device);

            let clipboard = Arc::new(ManualClipboard::new(local.device_id.clone()));
            let history = Arc::new(ClipHistoryStore::new(FileKvStore::new(default_history_path())?)?);
            let controller = ClipboardSyncController::new(local.device_id.clone(), clipboard.clone(), history);

            let raw_clip = ProtocolMessenger::new(CLIP_PROTOCOL, transport.clone());
            let trusted_ids: Vec<String> = trust_manager.list().into_iter().map(|d| d.device_id).collect();
            controller.bind_messaging(TrustedMessenger::new(raw_clip, move |from| trusted_ids.iter().any(|id| id == from)));
            controller.start().await?;

            clipboard.process_local_text(&text);
            tokio::time::sleep(Duration::from_millis(300)).await;
            println!("sent clip to {to}: {:?}", preview(&text));

            trust_manager.stop();
            transport.stop().await.ok();
        }
    }

    Ok(())
}

async fn run_serve(
    name: String,
    port: u16,
    id_path: Option<PathBuf>,
    trust_path: Option<PathBuf>,
    history_path: Option<PathBuf>,
) -> Result<()> {
    let id_path = id_path.unwrap_or_else(default_identity_path);
    let trust_path = trust_path.unwrap_or_else(default_trust_path);
    let history_path = history_path.unwrap_or_else(default_history_path);

    let identity = load_or_create_identity(&id_path)?;
    identity.rename(&name)?;
    let local = identity.get()?;
    identity.update_multiaddrs(vec![local_multiaddr(port, &local.device_id)])?;

    let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let transport = QuicTransport::bind(bind_addr)?;
    transport.start().await?;
    println!("serving as {} ({}) on port {port}", local.device_name, local.device_id);

    let registry = PeerRegistry::new();
    let trust_store = FileKvStore::new(trust_path.clone())?;
    let trust_manager = TrustManager::new(identity.clone(), trust_store);
    for device in trust_manager.list() {
        register_device_addr(&transport, &device);
        registry.upsert_trusted(device).await;
    }

    let history = Arc::new(ClipHistoryStore::new(FileKvStore::new(history_path)?)?);
    let clipboard = Arc::new(ManualClipboard::new(local.device_id.clone()));
    let sync_controller = ClipboardSyncController::new(local.device_id.clone(), clipboard.clone(), history.clone());

    let raw_trust = ProtocolMessenger::new(TRUST_PROTOCOL, transport.clone());
    let tm_for_dispatch = trust_manager.clone();
    raw_trust.on_message(Box::new(move |msg| {
        let tm = tm_for_dispatch.clone();
        tokio::spawn(async move {
            if let Err(err) = tm.handle_trust_message(msg).await {
                tracing::warn!(%err, "failed to handle trust message");
            }
        });
    }));
    trust_manager.bind_messenger(Arc::new(QuicTrustMessenger { inner: raw_trust }));

    let raw_clip = ProtocolMessenger::new(CLIP_PROTOCOL, transport.clone());
    let tm_for_gate = trust_manager.clone();
    let trusted_clip = TrustedMessenger::new(raw_clip, move |from| tm_for_gate.is_trusted(from));
    sync_controller.bind_messaging(trusted_clip);
    sync_controller.start().await?;

    let raw_history = ProtocolMessenger::new(HISTORY_PROTOCOL, transport.clone());
    let tm_for_history_gate = trust_manager.clone();
    let trusted_history = TrustedMessenger::new(raw_history, move |from| tm_for_history_gate.is_trusted(from));
    let history_sync = HistorySyncController::new(local.device_id.clone(), history.clone(), trusted_history);

    {
        let registry = registry.clone();
        let history_sync = history_sync.clone();
        let transport_for_register = transport.clone();
        trust_manager.on(
            TrustEvent::Approved,
            Box::new(move |device| {
                register_device_addr(&transport_for_register, &device);
                let registry = registry.clone();
                let history_sync = history_sync.clone();
                let device_id = device.device_id.clone();
                tokio::spawn(async move {
                    registry.upsert_trusted(device).await;
                    registry.set_online(&device_id).await;
                    history_sync.on_peer_approved(&device_id).await;
                });
            }),
        );
    }
    trust_manager.on(
        TrustEvent::Request,
        Box::new(move |device| {
            println!(
                "trust-request from {} ({}) — type 'accept {}' or 'reject {}'",
                device.device_name, device.device_id, device.device_id, device.device_id
            );
        }),
    );

    {
        let registry_connected = registry.clone();
        transport.on_peer_connected(Box::new(move |peer| {
            let registry = registry_connected.clone();
            tokio::spawn(async move { registry.set_online(&peer).await });
        }));
        let registry_disconnected = registry.clone();
        transport.on_peer_disconnected(Box::new(move |peer| {
            let registry = registry_disconnected.clone();
            tokio::spawn(async move { registry.set_offline(&peer).await });
        }));
    }

    history.on_new(Box::new(move |item| {
        if !item.is_local {
            println!("received clip from {}: {:?}", item.received_from, preview(&item.clip.content));
        }
    }));

    println!("commands: accept <id> | reject <id> | send <text> | peers | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "accept" | "reject" => {
                let device_id = rest.trim();
                if device_id.is_empty() {
                    println!("usage: accept|reject <device_id>");
                    continue;
                }
                if let Err(err) = trust_manager.send_trust_ack(device_id, cmd == "accept").await {
                    println!("error: {err}");
                }
            }
            "send" => clipboard.process_local_text(rest),
            "peers" => {
                for entry in registry.list_all().await {
                    println!("{} {:?} {}", entry.device.device_id, entry.status, entry.device.device_name);
                }
            }
            "quit" | "exit" => break,
            _ => println!("unknown command: {cmd}"),
        }
    }

    sync_controller.stop().await.ok();
    trust_manager.stop();
    transport.stop().await.ok();
    Ok(())
}
