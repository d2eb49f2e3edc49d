//! One endpoint of a bidirectional RPC session.

use crate::client::Client;
use crate::codec::{pipe, Codec};
use crate::error::{WireError, WireResult};
use crate::message::{ErrorObject, Frame, Message, MessageKind};
use crate::server::{CallContext, Server};
use std::sync::Arc;
use tracing::{debug, warn};

/// A [`Client`] and a [`Server`] sharing one [`Codec`].
///
/// A single receive loop ([`Remote::serve`]) routes replies to the client
/// and everything else to the server, so either side of the connection can
/// call the other at any time.
pub struct Remote {
    codec: Arc<dyn Codec>,
    client: Arc<Client>,
    server: Arc<Server>,
}

impl Remote {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self::with_server(codec, Arc::new(Server::new()))
    }

    /// Serve an existing method registry, e.g. one shared by every
    /// connection of a listener.
    pub fn with_server(codec: Arc<dyn Codec>, server: Arc<Server>) -> Self {
        Self {
            client: Arc::new(Client::new(codec.clone())),
            codec,
            server,
        }
    }

    /// Two Remotes wired to each other over an in-process pipe.
    pub fn pipe() -> (Remote, Remote) {
        let (a, b) = pipe();
        (Remote::new(Arc::new(a)), Remote::new(Arc::new(b)))
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Run the receive loop until the codec fails.
    ///
    /// Always returns an error; [`WireError::ConnectionClosed`] is the clean
    /// end of the session. Outstanding client calls are failed on exit.
    pub async fn serve(&self) -> WireResult<()> {
        let ctx = CallContext::new(self.client.clone(), self.codec.peer_addr());
        let err = loop {
            let message = match self.codec.recv().await {
                Ok(message) => message,
                Err(WireError::Json(e)) => {
                    warn!(error = %e, "Malformed frame");
                    self.reply(Message::error_response(None, ErrorObject::parse_error(e)))
                        .await;
                    continue;
                }
                Err(WireError::InvalidResponse(reason)) => {
                    self.reply(Message::error_response(
                        None,
                        ErrorObject::invalid_request(reason),
                    ))
                    .await;
                    continue;
                }
                Err(e) => break e,
            };

            if message.kind() == MessageKind::Response {
                let id = message.id.clone();
                if !self.client.deliver(message) {
                    debug!(id = ?id, "Discarding response with no pending call");
                }
                continue;
            }

            let server = self.server.clone();
            let codec = self.codec.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle(ctx, message).await {
                    if let Err(e) = codec.send(Frame::Single(response)).await {
                        debug!(error = %e, "Failed to send response");
                    }
                }
            });
        };

        self.client.fail_all();
        if err.is_closed() {
            debug!("Remote closed");
        } else {
            warn!(error = %err, "Remote receive loop failed");
        }
        Err(err)
    }

    async fn reply(&self, message: Message) {
        if let Err(e) = self.codec.send(Frame::Single(message)).await {
            debug!(error = %e, "Failed to send error response");
        }
    }

    /// Close the transport. Pending calls fail with `ConnectionClosed` and
    /// `serve` returns.
    pub async fn close(&self) -> WireResult<()> {
        self.client.fail_all();
        self.codec.close().await
    }
}

/// Two connected Remotes with their receive loops already running.
///
/// Register methods on each side's server before issuing calls.
pub fn serve_pipe() -> (Arc<Remote>, Arc<Remote>) {
    let (a, b) = Remote::pipe();
    let (a, b) = (Arc::new(a), Arc::new(b));
    for remote in [a.clone(), b.clone()] {
        tokio::spawn(async move {
            let _ = remote.serve().await;
        });
    }
    (a, b)
}
