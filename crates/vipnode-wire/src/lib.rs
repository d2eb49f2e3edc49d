//! Bidirectional JSON-RPC 2.0 transport.
//!
//! One connection carries calls in both directions: each end is a
//! [`Remote`] that owns a [`Client`] for outgoing calls and a [`Server`] for
//! incoming ones, multiplexed over a single [`Codec`] by one receive loop.
//!
//! ## Architecture
//!
//! - **Message / Frame**: JSON-RPC envelopes, single or batched
//! - **Codec**: framing over an in-process pipe or any async byte stream
//! - **Client**: outgoing calls correlated by ID, plus notifications
//! - **Server**: named method registry and dispatch
//! - **Remote**: one client + one server over one codec

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod remote;
pub mod server;

pub use client::Client;
pub use codec::{pipe, Codec, Framing, IoCodec, PipeCodec};
pub use error::{WireError, WireResult};
pub use message::{ErrorObject, Frame, Id, Message, MessageKind};
pub use remote::{serve_pipe, Remote};
pub use server::{CallContext, MethodHandler, RpcService, Server};
