//! Completion-queue RPC server core.
//!
//! A [`Dispatcher`] owns one completion queue and a pool of worker threads.
//! Every call is a [`CallState`] machine stored in an arena and addressed by
//! a [`Tag`]. An [`Endpoint`] accepts calls and performs the reads and writes
//! those machines register. Each registration comes back later as one
//! `(tag, ok)` [`Event`] that a worker uses to advance the call.
//!
//! * [`LoopbackEndpoint`]: in-process calls with a blocking client
//! * [`TcpEndpoint`] / [`TcpClient`]: one call per connection, postcard frames
//! * [`ServiceHandler`]: the business logic, unaware of call lifetimes

mod cancel;
mod client;
mod config;
mod context;
mod dispatcher;
mod endpoint;
mod envelope;
mod error;
mod event;
mod handler;
mod machine;
mod status;
pub mod wire;

pub use cancel::{CancelFlag, CancelReason};
pub use client::{StreamCall, TcpClient};
pub use config::{ConfigError, ServerConfig};
pub use context::{CallEnd, CallState};
pub use dispatcher::{Dispatcher, DispatcherBuilder, ShutdownMode, ShutdownReport, StatsSnapshot};
pub use endpoint::{ClientCall, Endpoint, LoopbackEndpoint, StreamItem, TcpEndpoint};
pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use error::{EndpointError, Error, HandlerError, Result};
pub use event::{Completion, CompletionSink, Event, IncomingCall, Op, Tag};
pub use handler::{CallKind, MethodInfo, ServiceHandler};
pub use status::{Status, StatusCode};
