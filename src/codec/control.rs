//! Control sub-protocol (spec.md §4.6.4): connection-level open/accept
//! handshake and ping/pong keepalive, plus the healthcheck work item
//! (spec.md §4.6.5) that drives a liveness probe over the active shell
//! session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmp::encode;
use tokio::sync::Mutex;

use crate::codec::shell::{self, ShellIo, ShellSession};
use crate::codec::{decode_message, encode_message, Message, Properties, Proto};
use crate::error::{AgentError, AgentResult, WorkOutcome};
use crate::http::HttpClient;

/// Control-protocol version this crate accepts (spec.md §4.6.4).
pub const CONTROL_VERSION: u8 = 1;

/// Sends one framed message over the interactive channel transport. The
/// socket itself is a platform concern (spec.md §1); this crate only
/// builds frames and hands them to whatever the platform wires in here.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, msg: &Message) -> AgentResult<()>;
}

/// Discards every frame. Used where no interactive channel is wired up
/// (demo/test agents).
pub struct NoopChannelSender;

#[async_trait]
impl ChannelSender for NoopChannelSender {
    async fn send(&self, _msg: &Message) -> AgentResult<()> {
        Ok(())
    }
}

/// Builds the service-originated `open` frame (spec.md §4.6.4). Device
/// code never sends this; it exists so tests and platform dispatch
/// shims can construct one to feed through [`classify`].
pub fn open() -> Message {
    Message::new(Proto::Control, Some("open".into()), None, Properties::default(), None)
}

/// Builds the device's reply to `open`: `accept`, whose body is a
/// binary-packed `{version, protocols}` map (spec.md §4.6.4, §8 S6).
pub fn accept(protocols: &[u16]) -> AgentResult<Message> {
    let body = encode_accept_body(protocols)?;
    Ok(Message::new(
        Proto::Control,
        Some("accept".into()),
        None,
        Properties::default(),
        Some(body),
    ))
}

fn encode_accept_body(protocols: &[u16]) -> AgentResult<Vec<u8>> {
    let mut out = Vec::new();
    encode::write_map_len(&mut out, 2).map_err(body_write_err)?;

    encode::write_str(&mut out, "version").map_err(body_write_err)?;
    encode::write_u8(&mut out, CONTROL_VERSION).map_err(body_write_err)?;

    encode::write_str(&mut out, "protocols").map_err(body_write_err)?;
    encode::write_array_len(&mut out, protocols.len() as u32).map_err(body_write_err)?;
    for proto in protocols {
        encode::write_u16(&mut out, *proto).map_err(body_write_err)?;
    }
    Ok(out)
}

fn body_write_err(e: impl std::fmt::Debug) -> AgentError {
    AgentError::MsgPackEncode(format!("{e:?}"))
}

/// Builds a control-channel ping frame (spec.md §4.6.4).
pub fn ping() -> Message {
    Message::new(Proto::Control, Some("ping".into()), None, Properties::default(), None)
}

/// Builds the pong reply to a received ping.
pub fn pong() -> Message {
    Message::new(Proto::Control, Some("pong".into()), None, Properties::default(), None)
}

/// Builds a control-channel error frame carrying a numeric `status`
/// (spec.md §4.6.1: `status` is always numeric on the wire).
pub fn error_frame(status: u16) -> Message {
    Message::new(
        Proto::Control,
        Some("error".into()),
        None,
        Properties {
            status: Some(status),
            ..Default::default()
        },
        None,
    )
}

/// Classifies one inbound control frame. `Unknown` covers frame types
/// this version doesn't recognize — the caller should ignore them
/// rather than treat them as fatal, per the forward-compatible framing
/// spec.md §4.6.1 sets out.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlEvent {
    Open,
    Ping,
    Pong,
    Error(Option<u16>),
    Unknown,
}

pub fn classify(msg: &Message) -> AgentResult<ControlEvent> {
    if msg.hdr.proto != Proto::Control {
        return Err(AgentError::Malformed(
            "classify called on a non-control frame".into(),
        ));
    }
    Ok(match msg.hdr.typ.as_deref() {
        Some("open") => ControlEvent::Open,
        Some("ping") => ControlEvent::Ping,
        Some("pong") => ControlEvent::Pong,
        Some("error") => ControlEvent::Error(msg.hdr.props.status),
        _ => ControlEvent::Unknown,
    })
}

/// The periodic healthcheck work item (spec.md §4.6.5, §4.4). Ensures
/// the transport is connected, then — if a shell session is active —
/// sends a liveness `ping` on it with `timeout = 2 × interval` and
/// `status = CONTROL`. A failed send tears the session down: the
/// platform's shell I/O is ended, the session state is freed, and the
/// connection is released.
pub async fn healthcheck(
    client: &dyn HttpClient,
    channel: &dyn ChannelSender,
    session: &Mutex<ShellSession>,
    io: &dyn ShellIo,
    healthcheck_interval_secs: u32,
) -> AgentResult<WorkOutcome> {
    client.connect().await?;

    let active_sid = {
        let guard = session.lock().await;
        guard.sid().map(str::to_string)
    };
    let Some(sid) = active_sid else {
        return Ok(WorkOutcome::KeepScheduled);
    };

    let probe = shell::healthcheck_ping(&sid, healthcheck_interval_secs);
    if let Err(err) = channel.send(&probe).await {
        tracing::warn!(error = %err, "healthcheck ping failed, tearing down shell session");
        let _ = io.shell_end().await;
        *session.lock().await = ShellSession::new();
        let _ = client.release().await;
    }

    Ok(WorkOutcome::KeepScheduled)
}

/// Wraps [`healthcheck`] as a `WorkFn` for registration with the
/// scheduler (spec.md §4.4, §4.6.5).
pub fn healthcheck_work_fn(
    client: Arc<dyn HttpClient>,
    channel: Arc<dyn ChannelSender>,
    session: Arc<Mutex<ShellSession>>,
    io: Arc<dyn ShellIo>,
    healthcheck_interval_secs: u32,
) -> crate::scheduler::WorkFn {
    Arc::new(move || {
        let client = client.clone();
        let channel = channel.clone();
        let session = session.clone();
        let io = io.clone();
        Box::pin(async move {
            healthcheck(
                client.as_ref(),
                channel.as_ref(),
                &session,
                io.as_ref(),
                healthcheck_interval_secs,
            )
            .await
        })
    })
}

/// Default healthcheck cadence (spec.md §3 `healthcheck_interval_seconds`).
pub const HEALTHCHECK_PERIOD: Duration = Duration::from_secs(30);

/// Parses one raw control frame off the wire and classifies it in one
/// step, for callers that only care about control traffic.
pub fn decode_control_event(raw: &[u8]) -> AgentResult<ControlEvent> {
    let msg = decode_message(raw)?;
    classify(&msg)
}
