//! Outbound transport: one fresh connection per message.
//!
//! The protocol's volume is O(√N) messages per lock cycle, so each send
//! connects, writes one framed message and closes — no pooling, no
//! multiplexing. [`Connector`] abstracts the dial so simulation tests can
//! substitute their own transport; retry with backoff is layered on top
//! by the node.

use core::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use futures::Sink;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::MessageCodec;
use crate::messages::Message;

/// A peer could not be reached or the message could not be written.
#[derive(Debug)]
pub struct ConnectError;

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to deliver message to peer")
    }
}

impl core::error::Error for ConnectError {}

/// Dials a peer by its address-table entry.
pub trait Connector: Clone + Send + Sync + 'static {
    type Connection: Sink<Message, Error = io::Error> + Send + Unpin;
    type Error: core::error::Error + Send + Sync + 'static;
    type ConnectFuture: Future<Output = Result<Self::Connection, Self::Error>> + Send;

    fn connect(&mut self, addr: &SocketAddr) -> Self::ConnectFuture;
}

/// Production connector over [`tokio::net::TcpStream`] with
/// [`MessageCodec`] framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Connector for TcpConnector {
    type Connection = Framed<TcpStream, MessageCodec>;
    type Error = io::Error;
    type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<Self::Connection>> + Send>>;

    fn connect(&mut self, addr: &SocketAddr) -> Self::ConnectFuture {
        let addr = *addr;
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            Ok(Framed::new(stream, MessageCodec::new()))
        })
    }
}
