//! Busline Core
//!
//! Runtime-agnostic dispatcher kernel for a process-local message bus:
//! - Packet model and definition/field records (`packet`)
//! - Refcounted definition catalog (`catalog`)
//! - Per-peer session state and queue handles (`peer`)
//! - The dispatcher event loop (`dispatcher`)
//! - Error types (`error`)

pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod packet;
pub mod peer;

pub mod prelude {
    pub use crate::catalog::Catalog;
    pub use crate::dispatcher::{
        channel, forward_peer_traffic, Dispatcher, DispatcherHandles, Traffic, TrafficKind,
        DEFAULT_ADMISSION_CAPACITY,
    };
    pub use crate::error::{BuslineError, Result};
    pub use crate::packet::{
        DataPacket, Definition, DefinitionKind, Fields, FieldSpec, FieldType, IdentifierRef, Packet,
    };
    pub use crate::peer::{
        new_peer, Admission, NewPeer, PeerHandle, PeerId, PeerSession, DEFAULT_QUEUE_CAPACITY,
    };
}
