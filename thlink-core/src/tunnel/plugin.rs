//! Packet interception hooks and the plugin loop contract.
//!
//! Hooks run synchronously inside the relay path and receive the current
//! record as `peer_id || body`; whatever they return is owned by the engine.
//! The plugin loop is a task spawned next to the relay that can push records
//! onto either endpoint on its own; it must finish once the quit signal fires.

use std::{cell::RefCell, future::Future, io, pin::Pin, rc::Rc};

use thlink_proto::{encode_frame, FrameType};
use tokio::{
    net::UdpSocket,
    sync::{watch, Mutex},
};

use super::stream::StreamWriter;

/// Verdict of a hook over one relayed record.
pub enum HookAction {
    /// Forward the returned `peer_id || body` record in the original direction.
    Forward(Vec<u8>),
    /// Send the returned `peer_id || body` record back where it came from.
    Reply(Vec<u8>),
    /// Swallow the record.
    Drop,
}

/// A packet hook: `peer_id || body` in, [`HookAction`] out. Must not block.
pub type Hook = Box<dyn FnMut(&[u8]) -> HookAction>;

/// The plugin loop body, spawned once per tunnel with I/O handles.
pub type PluginLoop = Box<dyn FnOnce(PluginIo) -> Pin<Box<dyn Future<Output = ()>>>>;

/// Interception points of a tunnel. Every field is optional; a missing hook
/// behaves as identity and a missing loop is simply not spawned.
#[derive(Default)]
pub struct TunnelHooks {
    /// Applied to records travelling stream → UDP.
    pub read_hook: Option<Hook>,
    /// Applied to records travelling UDP → stream.
    pub write_hook: Option<Hook>,
    /// Concurrent plugin task.
    pub plugin_loop: Option<PluginLoop>,
    /// Invoked exactly once when the first relay task exits.
    pub on_quit: Option<Box<dyn FnOnce()>>,
}

impl TunnelHooks {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A hook shared between the relay tasks of one direction.
#[derive(Clone)]
pub(super) struct SharedHook {
    hook: Rc<RefCell<Option<Hook>>>,
}

impl SharedHook {
    pub(super) fn new(hook: Option<Hook>) -> Self {
        Self {
            hook: Rc::new(RefCell::new(hook)),
        }
    }

    /// Applies the hook to a record, defaulting to an identity forward.
    pub(super) fn apply(&self, record: &[u8]) -> HookAction {
        match &mut *self.hook.borrow_mut() {
            Some(hook) => hook(record),
            None => HookAction::Forward(record.to_vec()),
        }
    }
}

/// Endpoint handles given to the plugin loop.
pub struct PluginIo {
    writer: Rc<Mutex<StreamWriter>>,
    udp: Rc<UdpSocket>,
    quit: watch::Receiver<bool>,
}

impl PluginIo {
    pub(super) fn new(writer: Rc<Mutex<StreamWriter>>, udp: Rc<UdpSocket>, quit: watch::Receiver<bool>) -> Self {
        Self { writer, udp, quit }
    }

    /// Sends a `peer_id || body` record onto the tunnel stream as a `DATA`
    /// frame.
    pub async fn send_stream(&self, record: &[u8]) -> io::Result<()> {
        let frame = encode_frame(FrameType::Data, record)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        self.writer.lock().await.write_all(&frame).await
    }

    /// The tunnel's UDP endpoint.
    pub fn udp(&self) -> &UdpSocket {
        &self.udp
    }

    /// Whether the tunnel has been told to quit.
    pub fn is_cancelled(&self) -> bool {
        *self.quit.borrow()
    }

    /// Completes once the tunnel tears down. The loop must return promptly
    /// after this resolves.
    pub async fn cancelled(&mut self) {
        while !*self.quit.borrow_and_update() {
            if self.quit.changed().await.is_err() {
                return;
            }
        }
    }
}
