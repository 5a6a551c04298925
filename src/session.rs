//! Per-client host sessions and the registry that owns them.
//!
//! A [`SessionProxy`] is the unit of work: it owns the TCP connection to the
//! host, drives the login handshake, and runs two background tasks - a read
//! pump polling the host for output and a writer draining client input.
//! The [`SessionRegistry`] maps client ids to proxies; a client has at most
//! one live session, and starting a new one retires the old one first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::handshake::{self, Credentials, HandshakeError};
use crate::protocol::ServerEvent;
use crate::telnet::{TelnetError, TelnetReader, TelnetStream, TelnetWriter};

/// How often the read pump polls the host for output.
///
/// This bounds both client-visible latency and idle wake frequency; 50 ms is
/// imperceptible on a screen-at-a-time application while keeping an idle
/// session near-free.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Capacity of the per-client event channel toward the gateway.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the per-session input channel toward the host.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Where a session is in its life.
///
/// `Handshaking` and `Ready` are the only states with a live connection;
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Sending half of a client's event channel.
///
/// The gateway holds the receiving half and forwards every event to the
/// client's WebSocket. Sends on a closed channel are dropped silently: the
/// client is gone and the session is about to be.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ServerEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: ServerEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("event sink closed, dropping event");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum StartError {
    #[error(transparent)]
    Telnet(#[from] TelnetError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("session closed before login completed")]
    Cancelled,
}

/// One client's proxied session to the host.
///
/// Cheaply cloneable; all clones share the same state, token, and channels.
/// The connection itself is not stored here: after the handshake its two
/// halves are moved into the pump and writer tasks, so `close()` never has
/// to touch a socket - it cancels the token and the owning tasks wind down
/// within one poll interval.
#[derive(Clone)]
pub struct SessionProxy {
    client_id: String,
    host: Arc<HostConfig>,
    events: EventSink,
    state: Arc<Mutex<SessionState>>,
    input_tx: Arc<Mutex<Option<mpsc::Sender<Bytes>>>>,
    cancelled: CancellationToken,
    pump_active: Arc<AtomicBool>,
}

impl std::fmt::Debug for SessionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProxy")
            .field("client_id", &self.client_id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl SessionProxy {
    pub fn new(client_id: &str, host: Arc<HostConfig>, events: EventSink) -> Self {
        Self {
            client_id: client_id.to_string(),
            host,
            events,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            input_tx: Arc::new(Mutex::new(None)),
            cancelled: CancellationToken::new(),
            pump_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// True while the background read pump is running.
    pub fn pump_active(&self) -> bool {
        self.pump_active.load(Ordering::Acquire)
    }

    /// True if `other` is a clone of this proxy (not merely a proxy for the
    /// same client id).
    fn same_session(&self, other: &SessionProxy) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Completes once the session has been closed, whatever the cause.
    pub async fn wait_closed(&self) {
        self.cancelled.cancelled().await;
    }

    /// Connect, log in, and go interactive.
    ///
    /// On success the session is `Ready`, the initial host output has been
    /// emitted, and the pump/writer tasks are running. On failure an `error`
    /// event is emitted and the session ends `Closed`. Every lower-level
    /// failure is absorbed here; nothing escapes as a panic or error value.
    pub async fn start(&self, creds: &Credentials) -> bool {
        let can_start = {
            let mut state = self.state.lock();
            if *state == SessionState::Idle {
                *state = SessionState::Handshaking;
                true
            } else {
                false
            }
        };
        if !can_start {
            self.events
                .send(ServerEvent::error("session already started"))
                .await;
            return false;
        }

        tracing::info!(
            client = %self.client_id,
            host = %self.host.host,
            port = self.host.port,
            "starting session"
        );

        let result = tokio::select! {
            r = self.establish(creds) => r,
            _ = self.cancelled.cancelled() => Err(StartError::Cancelled),
        };

        match result {
            Ok(()) => {
                tracing::info!(client = %self.client_id, "session ready");
                true
            }
            Err(e) => {
                if !matches!(e, StartError::Cancelled) {
                    tracing::warn!(client = %self.client_id, error = %e, "session start failed");
                    self.events
                        .send(ServerEvent::error(format!("connection failed: {e}")))
                        .await;
                }
                self.close();
                false
            }
        }
    }

    async fn establish(&self, creds: &Credentials) -> Result<(), StartError> {
        let cfg = &*self.host;
        let mut conn = TelnetStream::connect(&cfg.host, cfg.port, cfg.connect_timeout).await?;
        let script = handshake::login_script(&cfg.linux_user, creds, &cfg.timing);
        handshake::run(&mut conn, &script).await?;

        // Whatever the host painted during the final settle is the first
        // thing the client should see.
        let initial = conn.read_available()?;

        let (reader, writer) = conn.into_split();
        let input_tx = self.spawn_writer(writer);
        *self.input_tx.lock() = Some(input_tx);

        let ready = {
            let mut state = self.state.lock();
            if *state == SessionState::Handshaking {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        };
        if !ready {
            // close() landed mid-handshake; the cancelled token has already
            // stopped the writer.
            self.input_tx.lock().take();
            return Err(StartError::Cancelled);
        }

        if !initial.is_empty() {
            self.events.send(ServerEvent::output(&initial)).await;
        }

        self.spawn_pump(reader);
        Ok(())
    }

    /// Queue `data` for the host, verbatim.
    ///
    /// Input outside `Ready` is reported back as an `error` event rather
    /// than written. A single writer task drains the queue, so inbound
    /// writes stay in arrival order.
    pub async fn send_input(&self, data: Bytes) {
        let tx = {
            let state = self.state.lock();
            if *state == SessionState::Ready {
                self.input_tx.lock().clone()
            } else {
                None
            }
        };
        match tx {
            Some(tx) => {
                if tx.send(data).await.is_err() {
                    self.events
                        .send(ServerEvent::error("session is closing; input dropped"))
                        .await;
                }
            }
            None => {
                self.events
                    .send(ServerEvent::error("session not ready for input"))
                    .await;
            }
        }
    }

    /// End the session. Idempotent, callable from any state, never blocks
    /// waiting for the background tasks: it cancels the token and the pump
    /// and writer observe it within one poll interval, dropping their
    /// connection halves.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Closing | SessionState::Closed => return,
                _ => *state = SessionState::Closing,
            }
        }
        tracing::debug!(client = %self.client_id, "closing session");
        self.cancelled.cancel();
        self.input_tx.lock().take();
        *self.state.lock() = SessionState::Closed;
    }

    fn spawn_writer(&self, mut writer: TelnetWriter) -> mpsc::Sender<Bytes> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        let proxy = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = proxy.cancelled.cancelled() => break,
                    data = rx.recv() => match data {
                        Some(data) => {
                            if let Err(e) = writer.write_all(&data).await {
                                tracing::warn!(client = %proxy.client_id, error = %e, "write to host failed");
                                proxy.close();
                                proxy.events
                                    .send(ServerEvent::error(format!("write to host failed: {e}")))
                                    .await;
                                proxy.events.send(ServerEvent::Closed).await;
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!(client = %proxy.client_id, "input writer stopped");
        });
        tx
    }

    fn spawn_pump(&self, mut reader: TelnetReader) {
        let proxy = self.clone();
        proxy.pump_active.store(true, Ordering::Release);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = proxy.cancelled.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                match reader.read_available() {
                    Ok(data) => {
                        if data.is_empty() {
                            continue;
                        }
                        // Re-check the stop signal: close() may have landed
                        // while we slept, and a closed session must not keep
                        // emitting.
                        if proxy.cancelled.is_cancelled() {
                            break;
                        }
                        proxy.events.send(ServerEvent::output(&data)).await;
                    }
                    Err(e) => {
                        if proxy.cancelled.is_cancelled() {
                            break;
                        }
                        let message = match &e {
                            TelnetError::Closed => "connection closed by host".to_string(),
                            other => format!("read from host failed: {other}"),
                        };
                        tracing::info!(client = %proxy.client_id, error = %e, "read pump terminating");
                        proxy.close();
                        proxy.events.send(ServerEvent::error(message)).await;
                        proxy.events.send(ServerEvent::Closed).await;
                        break;
                    }
                }
            }
            proxy.close();
            proxy.pump_active.store(false, Ordering::Release);
            tracing::debug!(client = %proxy.client_id, "read pump stopped");
        });
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no active session")]
    NoActiveSession,
}

/// All live sessions, keyed by client id.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionProxy>>>,
    host: Arc<HostConfig>,
}

impl SessionRegistry {
    pub fn new(host: HostConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            host: Arc::new(host),
        }
    }

    /// Start a session for `client_id`, retiring any previous one first.
    ///
    /// The new proxy is registered before the handshake runs, so a
    /// `disconnect` arriving mid-login can find and cancel it. Returns
    /// whether the session reached `Ready`; on failure the entry is removed
    /// again (unless a newer session already replaced it).
    pub async fn start(&self, client_id: &str, creds: &Credentials, events: EventSink) -> bool {
        let previous = self.inner.write().remove(client_id);
        if let Some(old) = previous {
            tracing::info!(client = %client_id, "closing previous session before restart");
            old.close();
        }

        let proxy = SessionProxy::new(client_id, Arc::clone(&self.host), events);
        self.inner
            .write()
            .insert(client_id.to_string(), proxy.clone());
        self.monitor_close(client_id, &proxy);

        let ok = proxy.start(creds).await;
        if !ok {
            let mut inner = self.inner.write();
            if inner
                .get(client_id)
                .is_some_and(|current| current.same_session(&proxy))
            {
                inner.remove(client_id);
            }
        }
        ok
    }

    /// Forward input bytes to `client_id`'s session.
    pub async fn input(&self, client_id: &str, data: Bytes) -> Result<(), RegistryError> {
        let proxy = self
            .inner
            .read()
            .get(client_id)
            .cloned()
            .ok_or(RegistryError::NoActiveSession)?;
        proxy.send_input(data).await;
        Ok(())
    }

    /// Close and remove `client_id`'s session. Returns whether one existed.
    pub fn close(&self, client_id: &str) -> bool {
        match self.inner.write().remove(client_id) {
            Some(proxy) => {
                proxy.close();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<SessionProxy> {
        self.inner.read().get(client_id).cloned()
    }

    /// Drop the registry entry once its session closes for any reason
    /// (host hangup, I/O failure), so a retry starts from a clean slate.
    ///
    /// The identity check keeps the monitor from removing a newer session
    /// that replaced this one under the same client id.
    fn monitor_close(&self, client_id: &str, proxy: &SessionProxy) {
        let registry = self.clone();
        let proxy = proxy.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            proxy.wait_closed().await;
            let mut inner = registry.inner.write();
            if inner
                .get(&client_id)
                .is_some_and(|current| current.same_session(&proxy))
            {
                inner.remove(&client_id);
                tracing::debug!(client = %client_id, "session removed after close");
            }
        });
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session. Called on server shutdown.
    pub fn drain(&self) {
        let drained: Vec<(String, SessionProxy)> = self.inner.write().drain().collect();
        for (client_id, proxy) in drained {
            tracing::debug!(client = %client_id, "closing session on shutdown");
            proxy.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Timing;
    use crate::protocol::latin1_encode;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    fn creds() -> Credentials {
        Credentials {
            username: "zanon".into(),
            password: "pw".into(),
        }
    }

    fn fast_timing() -> Timing {
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

    fn test_host_config(addr: SocketAddr) -> HostConfig {
        HostConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            connect_timeout: Duration::from_secs(1),
            linux_user: "cdi".into(),
            timing: fast_timing(),
        }
    }

    const BANNER: &[u8] = b"MENU PRINCIPALE\r\n> ";

    /// One accepted fake-host connection. Dropping it hangs up.
    struct HostConn {
        to_client: mpsc::UnboundedSender<Vec<u8>>,
        from_client: mpsc::UnboundedReceiver<Vec<u8>>,
        closed: oneshot::Receiver<()>,
    }

    /// A scripted TurboGOLDEN stand-in: plays the login dialogue on every
    /// accepted connection, then bridges bytes through channels.
    async fn spawn_host() -> (SocketAddr, mpsc::UnboundedReceiver<HostConn>) {
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
                    // Test dropped the handle: hang up.
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
        // The three blind dismissals: \n, space, \n.
        let mut blind = [0u8; 3];
        stream.read_exact(&mut blind).await?;
        assert_eq!(&blind, b"\n \n");
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

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Gather `output` events until `len` bytes have arrived, failing on
    /// anything else.
    async fn collect_output(rx: &mut mpsc::Receiver<ServerEvent>, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            match next_event(rx).await {
                ServerEvent::Output { data } => out.extend_from_slice(&latin1_encode(&data)),
                other => panic!("unexpected event while collecting output: {other:?}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn start_reaches_ready_and_delivers_initial_output() {
        let (addr, mut conns) = spawn_host().await;
        let registry = SessionRegistry::new(test_host_config(addr));
        let (events, mut rx) = EventSink::channel();

        assert!(registry.start("client-1", &creds(), events).await);
        let _host = conns.recv().await.unwrap();

        let proxy = registry.get("client-1").unwrap();
        assert_eq!(proxy.state(), SessionState::Ready);
        assert!(proxy.pump_active());

        let banner = collect_output(&mut rx, BANNER.len()).await;
        assert_eq!(banner, BANNER);
    }

    #[tokio::test]
    async fn pump_relays_arbitrary_bytes_verbatim() {
        let (addr, mut conns) = spawn_host().await;
        let registry = SessionRegistry::new(test_host_config(addr));
        let (events, mut rx) = EventSink::channel();

        assert!(registry.start("client-1", &creds(), events).await);
        let host = conns.recv().await.unwrap();
        collect_output(&mut rx, BANNER.len()).await;

        // Every byte value, at length 10000.
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        host.to_client.send(payload.clone()).unwrap();

        let relayed = collect_output(&mut rx, payload.len()).await;
        assert_eq!(relayed, payload);
    }

    #[tokio::test]
    async fn input_reaches_the_host_unmodified() {
        let (addr, mut conns) = spawn_host().await;
        let registry = SessionRegistry::new(test_host_config(addr));
        let (events, mut rx) = EventSink::channel();

        assert!(registry.start("client-1", &creds(), events).await);
        let mut host = conns.recv().await.unwrap();
        collect_output(&mut rx, BANNER.len()).await;

        registry
            .input("client-1", Bytes::from_static(b"ls\n"))
            .await
            .unwrap();
        registry
            .input("client-1", Bytes::from_static(&[0x1b, 0x5b, 0x41, 0xe8, 0xff]))
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 8 {
            let chunk = tokio::time::timeout(Duration::from_secs(5), host.from_client.recv())
                .await
                .expect("timed out waiting for input")
                .expect("host connection gone");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"ls\n\x1b\x5b\x41\xe8\xff");
    }

    #[tokio::test]
    async fn input_without_a_session_is_rejected() {
        let (addr, _conns) = spawn_host().await;
        let registry = SessionRegistry::new(test_host_config(addr));
        assert_eq!(
            registry.input("ghost", Bytes::from_static(b"x")).await,
            Err(RegistryError::NoActiveSession)
        );
    }

    #[tokio::test]
    async fn restart_closes_the_previous_connection() {
        let (addr, mut conns) = spawn_host().await;
        let registry = SessionRegistry::new(test_host_config(addr));

        let (events1, mut rx1) = EventSink::channel();
        assert!(registry.start("client-1", &creds(), events1).await);
        let first = conns.recv().await.unwrap();
        collect_output(&mut rx1, BANNER.len()).await;

        let (events2, mut rx2) = EventSink::channel();
        assert!(registry.start("client-1", &creds(), events2).await);
        let _second = conns.recv().await.unwrap();
        collect_output(&mut rx2, BANNER.len()).await;

        // The old connection sees the hangup exactly once.
        tokio::time::timeout(Duration::from_secs(5), first.closed)
            .await
            .expect("first connection never closed")
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("client-1").unwrap().state(),
            SessionState::Ready
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_the_pump() {
        let (addr, mut conns) = spawn_host().await;
        let registry = SessionRegistry::new(test_host_config(addr));
        let (events, mut rx) = EventSink::channel();

        assert!(registry.start("client-1", &creds(), events).await);
        let host = conns.recv().await.unwrap();
        collect_output(&mut rx, BANNER.len()).await;

        let proxy = registry.get("client-1").unwrap();
        proxy.close();
        proxy.close();
        assert_eq!(proxy.state(), SessionState::Closed);

        // The pump observes the stop signal within a poll interval.
        tokio::time::sleep(POLL_INTERVAL * 4).await;
        assert!(!proxy.pump_active());

        // And the host sees exactly one hangup.
        tokio::time::timeout(Duration::from_secs(5), host.closed)
            .await
            .expect("host never saw the close")
            .unwrap();
    }

    #[tokio::test]
    async fn silent_host_fails_start_and_leaves_no_entry() {
        // A listener that accepts and says nothing: the first marker times out.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (peer, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(peer);
        });

        let registry = SessionRegistry::new(test_host_config(addr));
        let (events, mut rx) = EventSink::channel();
        let proxy = SessionProxy::new("client-1", Arc::new(test_host_config(addr)), events);

        assert!(!proxy.start(&creds()).await);
        assert_eq!(proxy.state(), SessionState::Closed);
        assert!(matches!(
            next_event(&mut rx).await,
            ServerEvent::Error { .. }
        ));
        assert_eq!(registry.len(), 0);
        hold.abort();
    }

    #[tokio::test]
    async fn failed_start_removes_the_registry_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (peer, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(peer);
        });

        let registry = SessionRegistry::new(test_host_config(addr));
        let (events, _rx) = EventSink::channel();
        assert!(!registry.start("client-1", &creds(), events).await);
        assert_eq!(registry.len(), 0);
        hold.abort();
    }

    #[tokio::test]
    async fn host_hangup_emits_error_and_closed() {
        let (addr, mut conns) = spawn_host().await;
        let registry = SessionRegistry::new(test_host_config(addr));
        let (events, mut rx) = EventSink::channel();

        assert!(registry.start("client-1", &creds(), events).await);
        let host = conns.recv().await.unwrap();
        collect_output(&mut rx, BANNER.len()).await;

        drop(host);

        let mut saw_error = false;
        loop {
            match next_event(&mut rx).await {
                ServerEvent::Error { .. } => saw_error = true,
                ServerEvent::Closed => break,
                ServerEvent::Output { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_error);
        if let Some(proxy) = registry.get("client-1") {
            assert_eq!(proxy.state(), SessionState::Closed);
        }

        // The dead session leaves the registry so a retry starts clean.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.len() != 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "dead session never left the registry"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn close_during_handshake_aborts_the_start() {
        // Host that presents the login prompt and then stalls.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(b"login:").await.unwrap();
            let _ = read_line(&mut peer).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let registry = SessionRegistry::new(test_host_config(addr));
        let (events, _rx) = EventSink::channel();

        let starter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start("client-1", &creds(), events).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.close("client-1"));

        assert!(!starter.await.unwrap());
        assert_eq!(registry.len(), 0);
        hold.abort();
    }

    #[tokio::test]
    async fn drain_closes_every_session() {
        let (addr, mut conns) = spawn_host().await;
        let registry = SessionRegistry::new(test_host_config(addr));

        let (events1, mut rx1) = EventSink::channel();
        let (events2, mut rx2) = EventSink::channel();
        assert!(registry.start("client-1", &creds(), events1).await);
        let first = conns.recv().await.unwrap();
        assert!(registry.start("client-2", &creds(), events2).await);
        let second = conns.recv().await.unwrap();
        collect_output(&mut rx1, BANNER.len()).await;
        collect_output(&mut rx2, BANNER.len()).await;

        registry.drain();
        assert!(registry.is_empty());
        tokio::time::timeout(Duration::from_secs(5), first.closed)
            .await
            .expect("first session never closed")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), second.closed)
            .await
            .expect("second session never closed")
            .unwrap();
    }
}
