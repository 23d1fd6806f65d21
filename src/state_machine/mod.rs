// Conversation endpoint state machine
//
// Endpoint states are owned by the transport; the lifecycle manager, dispatcher
// and sweeper only drive them through open/send/close.

pub mod states;

pub use states::{EndpointRole, EndpointState};
