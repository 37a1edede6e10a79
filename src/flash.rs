//! C2 — the A/B flash slot manager and boot-confirmation dance
//! (spec.md §4.2).

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{AgentError, AgentResult};

/// Opaque per-deployment token for an open write stream into the
/// inactive slot. Never `Clone`/`Copy`: Rust ownership expresses
/// spec.md §3's "never shared" invariant directly, and each consuming
/// operation (`close`, `set_pending`, `abort_deployment`) takes it by
/// value so a handle cannot be used twice.
#[derive(Debug)]
pub struct FlashHandle {
    pub(crate) slot_id: u32,
    pub(crate) cursor: u64,
    pub(crate) declared_size: u64,
}

impl FlashHandle {
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }
}

/// Flash slot manager contract (spec.md §4.2). `write` tolerates any
/// chunking; `offset` is informational, callers supply sequential
/// chunks.
#[async_trait]
pub trait FlashSlot: Send + Sync {
    async fn open(&self, name: &str, size: u64) -> AgentResult<FlashHandle>;

    async fn write(&self, handle: &mut FlashHandle, data: &[u8], offset: u64) -> AgentResult<()>;

    async fn close(&self, handle: &mut FlashHandle) -> AgentResult<()>;

    /// Marks the slot as the next-boot target. Consumes the handle.
    async fn set_pending(&self, handle: FlashHandle) -> AgentResult<()>;

    /// Discards any in-flight write. Consumes the handle.
    async fn abort_deployment(&self, handle: FlashHandle) -> AgentResult<()>;

    /// Marks the running image valid, canceling rollback.
    async fn confirm_image(&self) -> AgentResult<()>;

    /// True when the running image is committed (not in the rollback
    /// window).
    async fn is_image_confirmed(&self) -> AgentResult<bool>;
}

struct InMemorySlotState {
    inactive: Vec<u8>,
    pending_name: Option<String>,
    confirmed: bool,
    next_slot_id: u32,
}

/// Reference implementation for tests and the demo binary: models the
/// inactive slot as a growable byte buffer and tracks the
/// confirmed/pending bits a real bootloader would keep in its boot
/// configuration block.
pub struct InMemoryFlashSlot {
    state: Mutex<InMemorySlotState>,
}

impl Default for InMemoryFlashSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFlashSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemorySlotState {
                inactive: Vec::new(),
                pending_name: None,
                // A fresh slot starts confirmed: there is no pending
                // rollback window until a new image is written and set
                // pending.
                confirmed: true,
                next_slot_id: 0,
            }),
        }
    }

    /// Test/demo helper: the bytes currently written into the inactive
    /// slot.
    pub async fn written_bytes(&self) -> Vec<u8> {
        self.state.lock().await.inactive.clone()
    }

    pub async fn pending_name(&self) -> Option<String> {
        self.state.lock().await.pending_name.clone()
    }
}

#[async_trait]
impl FlashSlot for InMemoryFlashSlot {
    async fn open(&self, _name: &str, size: u64) -> AgentResult<FlashHandle> {
        let mut state = self.state.lock().await;
        state.inactive.clear();
        state.inactive.reserve(size as usize);
        state.next_slot_id += 1;
        Ok(FlashHandle {
            slot_id: state.next_slot_id,
            cursor: 0,
            declared_size: size,
        })
    }

    async fn write(&self, handle: &mut FlashHandle, data: &[u8], _offset: u64) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        state.inactive.extend_from_slice(data);
        handle.cursor += data.len() as u64;
        Ok(())
    }

    async fn close(&self, _handle: &mut FlashHandle) -> AgentResult<()> {
        Ok(())
    }

    async fn set_pending(&self, handle: FlashHandle) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        state.pending_name = Some(format!("slot-{}", handle.slot_id));
        state.confirmed = false;
        Ok(())
    }

    async fn abort_deployment(&self, _handle: FlashHandle) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        state.inactive.clear();
        state.pending_name = None;
        Ok(())
    }

    async fn confirm_image(&self) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        if state.pending_name.is_none() && state.confirmed {
            // Nothing pending — still fine to confirm, matches a
            // no-op confirm on an already-committed image.
        }
        state.confirmed = true;
        Ok(())
    }

    async fn is_image_confirmed(&self) -> AgentResult<bool> {
        Ok(self.state.lock().await.confirmed)
    }
}

/// Surfaces a flash I/O fault as `AgentError::FlashError` with context,
/// matching spec.md §7's leaf-I/O-error mapping policy.
pub(crate) fn flash_fault(context: &str) -> AgentError {
    AgentError::FlashError(context.to_string())
}
