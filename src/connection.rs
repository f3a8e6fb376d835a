use crate::error::{MigrationError, ProtocolError};
use crate::msg::Msg;
use crate::protocol::Protocol;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub type ConnId = Uuid;

/// Which entity currently owns a connection. Readable from any thread;
/// only the owning loop writes it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AttachTo {
    Invalid = 0,
    App = 1,
    Engine = 2,
    Remote = 3,
}

impl AttachTo {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => AttachTo::App,
            2 => AttachTo::Engine,
            3 => AttachTo::Remote,
            _ => AttachTo::Invalid,
        }
    }
}

/// Where a connection stands in its handover from the app to an
/// engine.
///
/// `Init`: owned by the app, nothing received yet. `FirstMsgSeen`: the
/// first message went up to the app; later inbound is buffered inside
/// the protocol. `Done`: delivery flows to the final owner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MigrationState {
    Init = 0,
    FirstMsgSeen = 1,
    Done = 2,
}

impl MigrationState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => MigrationState::FirstMsgSeen,
            2 => MigrationState::Done,
            _ => MigrationState::Init,
        }
    }

    /// The only legal moves. `FirstMsgSeen -> Init` is the reset taken
    /// when the target engine is gone and the connection returns to
    /// the app; `Init -> Done` is the direct upgrade for engines
    /// sharing the app loop.
    pub fn transition(self, to: MigrationState) -> Result<MigrationState, MigrationError> {
        use MigrationState::*;
        match (self, to) {
            (Init, FirstMsgSeen) => Ok(to),
            (FirstMsgSeen, Done) => Ok(to),
            (FirstMsgSeen, Init) => Ok(to),
            (Init, Done) => Ok(to),
            (from, to) => Err(MigrationError { from, to }),
        }
    }
}

/// One physical channel and the protocol speaking over it.
pub struct Connection {
    id: ConnId,
    protocol: Box<dyn Protocol>,
    attach: Arc<AtomicU8>,
    /// Peer app uri, learned from the first message's src.
    remote_uri: String,
    duplicate: bool,
    closing: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(protocol: Box<dyn Protocol>) -> Self {
        let id = protocol.conn_id();
        Self {
            id,
            protocol,
            attach: Arc::new(AtomicU8::new(AttachTo::Invalid as u8)),
            remote_uri: String::new(),
            duplicate: false,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn attach(&self) -> AttachTo {
        AttachTo::from_u8(self.attach.load(Ordering::Acquire))
    }

    pub fn set_attach(&self, to: AttachTo) {
        self.attach.store(to as u8, Ordering::Release);
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    pub fn set_remote_uri(&mut self, uri: &str) {
        self.remote_uri = uri.to_string();
    }

    /// Duplicated channels get torn down without that teardown meaning
    /// anything for graph health.
    pub fn mark_duplicate(&mut self) {
        self.duplicate = true;
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    pub fn send_msg(&mut self, msg: &Msg) -> Result<(), ProtocolError> {
        self.protocol.send_msg(msg)
    }

    pub fn drain_inbound(&mut self) -> Vec<Msg> {
        self.protocol.drain_inbound()
    }

    pub fn migration_state(&self) -> MigrationState {
        self.protocol.migration_state()
    }

    pub fn protocol_mut(&mut self) -> &mut dyn Protocol {
        self.protocol.as_mut()
    }

    /// Idempotent: only the first call reaches the protocol. The
    /// connection is finalized later, when the protocol confirms by
    /// notifying its sink of transport closure.
    pub fn close(&mut self) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.protocol.close();
        true
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use MigrationState::*;
        assert_eq!(Init.transition(FirstMsgSeen), Ok(FirstMsgSeen));
        assert_eq!(FirstMsgSeen.transition(Done), Ok(Done));
        assert_eq!(FirstMsgSeen.transition(Init), Ok(Init));
        assert_eq!(Init.transition(Done), Ok(Done));
    }

    #[test]
    fn illegal_transitions_are_typed_errors() {
        use MigrationState::*;
        for (from, to) in [
            (Done, Init),
            (Done, FirstMsgSeen),
            (Init, Init),
            (Done, Done),
            (FirstMsgSeen, FirstMsgSeen),
        ] {
            let err = from.transition(to).unwrap_err();
            assert_eq!(err, MigrationError { from, to });
        }
    }
}
