//! Shell sub-protocol session state machine (spec.md §4.6.3). The
//! device is always the receiving side: the service opens a session
//! with `new`/`spawn`, streams bytes with `shell`/`resize`, and tears
//! it down with `stop`. The device's reaction to each message type is
//! expressed through [`ShellIo`], the platform's terminal boundary.

use async_trait::async_trait;

use crate::codec::{Message, Properties, Proto, STATUS_CONTROL, STATUS_NORMAL};
use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Closed,
    Opening,
    Active,
    Closing,
}

/// The platform's pseudo-terminal boundary (spec.md §4.6.3). A real
/// implementation spawns (or writes to) a shell process; this crate
/// only drives the callbacks in response to inbound frames.
#[async_trait]
pub trait ShellIo: Send + Sync {
    async fn shell_begin(&self, width: u16, height: u16) -> AgentResult<()>;
    async fn shell_write(&self, data: &[u8]) -> AgentResult<()>;
    async fn shell_resize(&self, width: u16, height: u16) -> AgentResult<()>;
    async fn shell_end(&self) -> AgentResult<()>;
}

/// The single shell session handle a device supports at a time (spec.md
/// §3: "a shell session is identified by exactly one session_id string
/// at a time").
pub struct ShellSession {
    sid: Option<String>,
    state: ShellState,
}

impl Default for ShellSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellSession {
    pub fn new() -> Self {
        Self {
            sid: None,
            state: ShellState::Closed,
        }
    }

    pub fn state(&self) -> ShellState {
        self.state
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.state == ShellState::Active
    }

    /// Routes one inbound shell-protocol frame, invoking the matching
    /// [`ShellIo`] callback and returning any reply frame to send.
    pub async fn on_message(
        &mut self,
        msg: &Message,
        io: &dyn ShellIo,
    ) -> AgentResult<Option<Message>> {
        match msg.hdr.typ.as_deref() {
            Some("new") | Some("spawn") => self.handle_new(msg, io).await,
            Some("shell") => self.handle_shell(msg, io).await,
            Some("resize") => self.handle_resize(msg, io).await,
            Some("stop") => self.handle_stop(msg, io).await,
            Some("ping") => self.handle_ping(msg),
            Some("pong") => Ok(None),
            _ => Ok(None),
        }
    }

    async fn handle_new(&mut self, msg: &Message, io: &dyn ShellIo) -> AgentResult<Option<Message>> {
        if self.state != ShellState::Closed {
            // spec.md §3: a second spawn while one is active is a no-op.
            return Ok(None);
        }
        let sid = msg
            .hdr
            .sid
            .clone()
            .ok_or_else(|| AgentError::Malformed("new/spawn frame missing sid".into()))?;
        let width = msg
            .hdr
            .props
            .terminal_width
            .ok_or_else(|| AgentError::Malformed("new/spawn frame missing terminal_width".into()))?;
        let height = msg
            .hdr
            .props
            .terminal_height
            .ok_or_else(|| AgentError::Malformed("new/spawn frame missing terminal_height".into()))?;

        self.state = ShellState::Opening;
        io.shell_begin(width, height).await?;
        self.state = ShellState::Active;
        self.sid = Some(sid.clone());

        Ok(Some(Message::new(
            Proto::Shell,
            msg.hdr.typ.clone(),
            Some(sid),
            Properties {
                status: Some(STATUS_NORMAL),
                ..Default::default()
            },
            None,
        )))
    }

    async fn handle_shell(&mut self, msg: &Message, io: &dyn ShellIo) -> AgentResult<Option<Message>> {
        self.require_active_sid(msg)?;
        if let Some(body) = &msg.body {
            io.shell_write(body).await?;
        }
        Ok(None)
    }

    async fn handle_resize(&mut self, msg: &Message, io: &dyn ShellIo) -> AgentResult<Option<Message>> {
        self.require_active_sid(msg)?;
        let width = msg
            .hdr
            .props
            .terminal_width
            .ok_or_else(|| AgentError::Malformed("resize frame missing terminal_width".into()))?;
        let height = msg
            .hdr
            .props
            .terminal_height
            .ok_or_else(|| AgentError::Malformed("resize frame missing terminal_height".into()))?;
        io.shell_resize(width, height).await?;
        Ok(None)
    }

    async fn handle_stop(&mut self, msg: &Message, io: &dyn ShellIo) -> AgentResult<Option<Message>> {
        self.require_active_sid(msg)?;
        let sid = self.sid.take().expect("require_active_sid checked sid is set");
        self.state = ShellState::Closing;
        io.shell_end().await?;
        self.state = ShellState::Closed;

        Ok(Some(Message::new(
            Proto::Shell,
            msg.hdr.typ.clone(),
            Some(sid),
            Properties {
                status: Some(STATUS_NORMAL),
                ..Default::default()
            },
            None,
        )))
    }

    fn handle_ping(&self, msg: &Message) -> AgentResult<Option<Message>> {
        let sid = msg
            .hdr
            .sid
            .clone()
            .ok_or_else(|| AgentError::Malformed("ping frame missing sid".into()))?;
        Ok(Some(Message::new(
            Proto::Shell,
            Some("pong".into()),
            Some(sid),
            Properties::default(),
            None,
        )))
    }

    fn require_active_sid(&self, msg: &Message) -> AgentResult<()> {
        if self.state != ShellState::Active {
            return Err(AgentError::Fatal(format!(
                "shell frame for an inactive session (state {:?})",
                self.state
            )));
        }
        if msg.hdr.sid.as_deref() != self.sid.as_deref() {
            return Err(AgentError::Malformed(format!(
                "frame for sid {:?} routed to session {:?}",
                msg.hdr.sid, self.sid
            )));
        }
        Ok(())
    }
}

/// Discards every callback. Used where no real terminal is wired up
/// (demo/test agents).
pub struct NoopShellIo;

#[async_trait]
impl ShellIo for NoopShellIo {
    async fn shell_begin(&self, _width: u16, _height: u16) -> AgentResult<()> {
        Ok(())
    }
    async fn shell_write(&self, _data: &[u8]) -> AgentResult<()> {
        Ok(())
    }
    async fn shell_resize(&self, _width: u16, _height: u16) -> AgentResult<()> {
        Ok(())
    }
    async fn shell_end(&self) -> AgentResult<()> {
        Ok(())
    }
}

/// Builds the healthcheck's liveness probe on the active shell session
/// (spec.md §4.6.3, §4.6.5): `timeout = 2 × healthcheck_interval`,
/// `status = CONTROL`.
pub fn healthcheck_ping(sid: &str, healthcheck_interval_secs: u32) -> Message {
    Message::new(
        Proto::Shell,
        Some("ping".into()),
        Some(sid.to_string()),
        Properties {
            timeout: Some(healthcheck_interval_secs.saturating_mul(2)),
            status: Some(STATUS_CONTROL),
            ..Default::default()
        },
        None,
    )
}

/// `print_shell` (spec.md §4.6.6): one `shell`-type frame, status
/// NORMAL, carrying the caller's bytes as body.
pub fn print_shell(sid: &str, bytes: &[u8]) -> Message {
    Message::new(
        Proto::Shell,
        Some("shell".into()),
        Some(sid.to_string()),
        Properties {
            status: Some(STATUS_NORMAL),
            ..Default::default()
        },
        Some(bytes.to_vec()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingIo {
        begun: Mutex<Option<(u16, u16)>>,
        written: Mutex<Vec<u8>>,
        resized: Mutex<Option<(u16, u16)>>,
        ended: Mutex<bool>,
    }

    #[async_trait]
    impl ShellIo for RecordingIo {
        async fn shell_begin(&self, width: u16, height: u16) -> AgentResult<()> {
            *self.begun.lock().unwrap() = Some((width, height));
            Ok(())
        }
        async fn shell_write(&self, data: &[u8]) -> AgentResult<()> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
        async fn shell_resize(&self, width: u16, height: u16) -> AgentResult<()> {
            *self.resized.lock().unwrap() = Some((width, height));
            Ok(())
        }
        async fn shell_end(&self) -> AgentResult<()> {
            *self.ended.lock().unwrap() = true;
            Ok(())
        }
    }

    fn new_frame(sid: &str, width: u16, height: u16) -> Message {
        Message::new(
            Proto::Shell,
            Some("new".into()),
            Some(sid.into()),
            Properties {
                terminal_width: Some(width),
                terminal_height: Some(height),
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn s4_shell_session_lifecycle() {
        let io = RecordingIo::default();
        let mut session = ShellSession::new();

        let reply = session.on_message(&new_frame("s1", 80, 24), &io).await.unwrap().unwrap();
        assert_eq!(*io.begun.lock().unwrap(), Some((80, 24)));
        assert_eq!(reply.hdr.typ.as_deref(), Some("new"));
        assert_eq!(reply.hdr.sid.as_deref(), Some("s1"));
        assert_eq!(reply.hdr.props.status, Some(STATUS_NORMAL));
        assert_eq!(session.state(), ShellState::Active);

        let shell_frame = Message::new(
            Proto::Shell,
            Some("shell".into()),
            Some("s1".into()),
            Properties::default(),
            Some(b"ls\n".to_vec()),
        );
        let reply = session.on_message(&shell_frame, &io).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(&*io.written.lock().unwrap(), b"ls\n");

        let stop_frame = Message::new(
            Proto::Shell,
            Some("stop".into()),
            Some("s1".into()),
            Properties::default(),
            None,
        );
        let reply = session.on_message(&stop_frame, &io).await.unwrap().unwrap();
        assert_eq!(reply.hdr.typ.as_deref(), Some("stop"));
        assert_eq!(reply.hdr.props.status, Some(STATUS_NORMAL));
        assert!(*io.ended.lock().unwrap());
        assert_eq!(session.state(), ShellState::Closed);
        assert_eq!(session.sid(), None);
    }

    #[tokio::test]
    async fn resize_invokes_shell_resize() {
        let io = RecordingIo::default();
        let mut session = ShellSession::new();
        session.on_message(&new_frame("s1", 80, 24), &io).await.unwrap();

        let resize = Message::new(
            Proto::Shell,
            Some("resize".into()),
            Some("s1".into()),
            Properties {
                terminal_width: Some(120),
                terminal_height: Some(40),
                ..Default::default()
            },
            None,
        );
        session.on_message(&resize, &io).await.unwrap();
        assert_eq!(*io.resized.lock().unwrap(), Some((120, 40)));
    }

    #[tokio::test]
    async fn second_spawn_while_active_is_a_no_op() {
        let io = RecordingIo::default();
        let mut session = ShellSession::new();
        session.on_message(&new_frame("s1", 80, 24), &io).await.unwrap();

        let reply = session.on_message(&new_frame("s2", 10, 10), &io).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(session.sid(), Some("s1"));
        assert_eq!(*io.begun.lock().unwrap(), Some((80, 24)));
    }

    #[tokio::test]
    async fn shell_frame_for_wrong_sid_is_rejected() {
        let io = RecordingIo::default();
        let mut session = ShellSession::new();
        session.on_message(&new_frame("s1", 80, 24), &io).await.unwrap();

        let foreign = Message::new(
            Proto::Shell,
            Some("shell".into()),
            Some("other".into()),
            Properties::default(),
            Some(b"x".to_vec()),
        );
        assert!(session.on_message(&foreign, &io).await.is_err());
    }

    #[test]
    fn s5_healthcheck_ping_on_active_session() {
        let ping = healthcheck_ping("s1", 30);
        assert_eq!(ping.hdr.typ.as_deref(), Some("ping"));
        assert_eq!(ping.hdr.sid.as_deref(), Some("s1"));
        assert_eq!(ping.hdr.props.timeout, Some(60));
        assert_eq!(ping.hdr.props.status, Some(STATUS_CONTROL));
    }
}
