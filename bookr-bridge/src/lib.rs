//! bookr-bridge: request/response bridge to a long-lived child process.

mod call;
mod value;

pub mod bridge;
pub mod dispatcher;

pub use bridge::codec::{LineCodec, decode_response, decode_value};
pub use bridge::protocol::{ControlRequest, ProtocolError};
pub use call::{CallStatus, PendingCall};
pub use dispatcher::{
    BridgeError, ChildSpawner, CommandSpawner, Dispatcher, DispatcherConfig, DispatcherState,
    FatalHandler, StartupError,
};
pub use value::{Record, Value};
