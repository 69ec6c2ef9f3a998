//! Cloud anchor hosting and resolving.
//!
//! - [`state`]: service task states and the failure taxonomy
//! - [`adapter`]: the cloud session wrapper and its delegate event stream
//! - [`handler`]: per-request state machine, correlation and retry

pub mod adapter;
pub mod handler;
pub mod state;

pub use adapter::{
    CloudAnchorService, CloudAnchorSnapshot, CloudEventSink, CloudServiceConnector,
    CloudSessionAdapter, CloudTaskEvent, CloudTaskHandle,
};
pub use handler::{
    CloudAnchorHandler, CloudCompletion, CloudOutcome, CloudRequestPolicy, CloudTarget,
    CloudTicket,
};
pub use state::{CloudAnchorState, CloudFailure};
