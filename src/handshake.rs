//! The fixed TurboGOLDEN login sequence.
//!
//! Reaching the interactive main menu takes four markered exchanges (telnet
//! login, application start, application username, password) followed by
//! three banner dismissals. The banners - end-of-period notice, transient
//! frame error, menu entry - carry no stable marker, so those steps are
//! blind sleep-then-write. That trades a fixed wall-clock cost for
//! determinism and is a known fragility against a slow host: if a banner is
//! late, the dismissal keystroke lands early and the banner text simply
//! reaches the client as ordinary session output.

use std::time::Duration;

use bytes::Bytes;

use crate::protocol::latin1_encode;
use crate::telnet::{TelnetError, TelnetStream};

/// Username/password pair for the application-level login.
///
/// The password may be empty; several TurboGOLDEN accounts have none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// One expect/respond exchange of the login script.
#[derive(Debug, Clone)]
pub struct HandshakeStep {
    /// Marker to wait for before responding. `None` makes this a blind
    /// step: sleep for `wait`, then write.
    pub expect: Option<Bytes>,
    /// Upper bound on the marker wait, or the blind sleep length.
    pub wait: Duration,
    /// Bytes written once the marker arrives (or the wait elapses).
    pub send: Bytes,
    /// Pause after the write, giving the host time to redraw.
    pub settle: Duration,
}

/// Wall-clock pacing of the script.
///
/// Production uses [`Timing::default`], lifted from the observed behavior of
/// the real host (the application takes 8-15 s to start after the telnet
/// login). Tests compress these to exercise the script against an
/// in-process peer.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub login_prompt: Duration,
    pub app_start: Duration,
    pub password_prompt: Duration,
    pub banner_wait: Duration,
    pub frame_wait: Duration,
    pub menu_wait: Duration,
    pub menu_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            login_prompt: Duration::from_secs(5),
            app_start: Duration::from_secs(15),
            password_prompt: Duration::from_secs(5),
            banner_wait: Duration::from_secs(5),
            frame_wait: Duration::from_secs(2),
            menu_wait: Duration::from_secs(2),
            menu_settle: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// A marker never showed up in time. On the wire this is
    /// indistinguishable from rejected credentials - a wrong password makes
    /// the host re-prompt instead of advancing - so both outcomes share
    /// this one kind.
    #[error("host never presented {marker:?} within {timeout:?} (application unreachable or credentials rejected)")]
    Prompt { marker: String, timeout: Duration },

    #[error(transparent)]
    Connection(#[from] TelnetError),
}

/// Build the fixed login script for one session attempt.
///
/// `linux_user` is the account the telnet layer logs into before the
/// application starts; the application credentials follow. All text is
/// latin-1, matching the host.
pub fn login_script(linux_user: &str, creds: &Credentials, timing: &Timing) -> Vec<HandshakeStep> {
    let mut username = latin1_encode(&creds.username).to_vec();
    username.push(b'\n');
    let mut password = latin1_encode(&creds.password).to_vec();
    password.push(b'\n');
    let mut login = latin1_encode(linux_user).to_vec();
    login.push(b'\n');

    vec![
        // Telnet-level login.
        HandshakeStep {
            expect: Some(Bytes::from_static(b"login:")),
            wait: timing.login_prompt,
            send: Bytes::from(login),
            settle: Duration::ZERO,
        },
        // The application auto-starts and asks for its own username.
        HandshakeStep {
            expect: Some(Bytes::from_static(b"Nome dell'utente:")),
            wait: timing.app_start,
            send: Bytes::from(username),
            settle: Duration::ZERO,
        },
        HandshakeStep {
            expect: Some(Bytes::from_static(b"Chiave di accesso:")),
            wait: timing.password_prompt,
            send: Bytes::from(password),
            settle: Duration::ZERO,
        },
        // Blind dismissals: end-of-period notice, frame error, main menu.
        HandshakeStep {
            expect: None,
            wait: timing.banner_wait,
            send: Bytes::from_static(b"\n"),
            settle: Duration::ZERO,
        },
        HandshakeStep {
            expect: None,
            wait: timing.frame_wait,
            send: Bytes::from_static(b" "),
            settle: Duration::ZERO,
        },
        HandshakeStep {
            expect: None,
            wait: timing.menu_wait,
            send: Bytes::from_static(b"\n"),
            settle: timing.menu_settle,
        },
    ]
}

/// Execute `script` over `conn`, strictly in order.
///
/// A marker timeout aborts the attempt; blind steps cannot fail short of an
/// I/O error on the write itself.
pub async fn run(conn: &mut TelnetStream, script: &[HandshakeStep]) -> Result<(), HandshakeError> {
    for (i, step) in script.iter().enumerate() {
        match &step.expect {
            Some(marker) => {
                tracing::debug!(step = i, marker = %String::from_utf8_lossy(marker), "waiting for prompt");
                conn.read_until(marker, step.wait)
                    .await
                    .map_err(|e| match e {
                        TelnetError::ReadTimeout { marker } => HandshakeError::Prompt {
                            marker,
                            timeout: step.wait,
                        },
                        other => HandshakeError::Connection(other),
                    })?;
            }
            None => {
                tracing::debug!(step = i, wait = ?step.wait, "blind step");
                tokio::time::sleep(step.wait).await;
            }
        }
        conn.write_all(&step.send).await?;
        if !step.settle.is_zero() {
            tokio::time::sleep(step.settle).await;
        }
    }
    tracing::debug!("login script complete");
    Ok(())
}
