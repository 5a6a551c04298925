#![allow(dead_code)]

//! Shared fixtures: a scripted TurboGOLDEN stand-in and a running bridge.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use goldenbridge::api::{self, AppState};
use goldenbridge::config::HostConfig;
use goldenbridge::handshake::Timing;
use goldenbridge::session::SessionRegistry;
use goldenbridge::shutdown::ShutdownCoordinator;

/// What the fake host paints once the login dance is over.
pub const BANNER: &[u8] = b"MENU PRINCIPALE\r\n> ";

/// Handshake pacing compressed for tests.
pub fn fast_timing() -> Timing {
    Timing {
        login_prompt: Duration::from_millis(500),
        app_start: Duration::from_millis(500),
        password_prompt: Duration::from_millis(500),
        banner_wait: Duration::from_millis(20),
        frame_wait: Duration::from_millis(20),
        menu_wait: Duration::from_millis(20),
        menu_settle: Duration::from_millis(50),
    }
}

pub fn host_config(addr: SocketAddr) -> HostConfig {
    HostConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connect_timeout: Duration::from_secs(1),
        linux_user: "cdi".into(),
        timing: fast_timing(),
    }
}

/// One accepted fake-host connection. Dropping it hangs up.
pub struct HostConn {
    /// Inject host output toward the client.
    pub to_client: mpsc::UnboundedSender<Vec<u8>>,
    /// Bytes the host read after the handshake.
    pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Fires when the connection ends, either side.
    pub closed: oneshot::Receiver<()>,
}

/// A scripted TurboGOLDEN stand-in: every accepted connection is walked
/// through the real login dialogue (markers, credentials, three blind
/// dismissals), greeted with [`BANNER`], then bridged through channels.
pub async fn spawn_fake_host() -> (SocketAddr, mpsc::UnboundedReceiver<HostConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
            let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
            let (closed_tx, closed_rx) = oneshot::channel();
            if conn_tx
                .send(HostConn {
                    to_client: to_client_tx,
                    from_client: from_client_rx,
                    closed: closed_rx,
                })
                .is_err()
            {
                break;
            }
            tokio::spawn(serve_conn(stream, to_client_rx, from_client_tx, closed_tx));
        }
    });
    (addr, conn_rx)
}

/// A host that accepts connections and never says a word; every login
/// attempt against it times out on the first marker.
pub async fn spawn_silent_host() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

async fn serve_conn(
    mut stream: TcpStream,
    mut to_client: mpsc::UnboundedReceiver<Vec<u8>>,
    from_client: mpsc::UnboundedSender<Vec<u8>>,
    closed: oneshot::Sender<()>,
) {
    if drive_login(&mut stream).await.is_err() {
        let _ = closed.send(());
        return;
    }
    let (mut rd, mut wr) = stream.into_split();
    let _ = wr.write_all(BANNER).await;
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            out = to_client.recv() => match out {
                Some(data) => {
                    if wr.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            n = rd.read(&mut buf) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = from_client.send(buf[..n].to_vec());
                }
            },
        }
    }
    let _ = closed.send(());
}

async fn drive_login(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(b"\r\nlogin:").await?;
    read_line(stream).await?;
    stream.write_all(b"Nome dell'utente:").await?;
    read_line(stream).await?;
    stream.write_all(b"Chiave di accesso:").await?;
    read_line(stream).await?;
    let mut blind = [0u8; 3];
    stream.read_exact(&mut blind).await?;
    Ok(())
}

async fn read_line(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(line);
        }
    }
}

/// Start the bridge against `host` on an ephemeral port.
pub async fn start_bridge(host: HostConfig, token: Option<String>) -> SocketAddr {
    let state = AppState {
        sessions: SessionRegistry::new(host),
        shutdown: ShutdownCoordinator::new(),
    };
    let app = api::router(state, token);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
