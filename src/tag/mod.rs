//! Connection lifecycle of one tag: pairing, protocol initialization, link
//! configuration, firmware gating and reconnection.

mod collaborators;
mod connection;
mod pairing;
mod state;

pub use collaborators::{
    ConnectedTag, DfuManager, EmptyStateMachine, InitializationStateMachine, ProtocolInitializer,
    StateMachine, TagHandle,
};
pub use connection::{ConnectionContext, ConnectionStateMachine};
pub use pairing::PairingStateMachine;
pub use state::{
    ConnectionState, ConnectionStateType, DfuInfo, DfuStatus, InitializationState,
    TagPairingState, TagPairingStateType,
};
