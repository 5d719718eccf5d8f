//! Transport layer - TLS-wrapped TCP.
//!
//! Connections dial through a [`Connector`], so the TLS socket can be
//! swapped for an in-memory stream.

mod tls;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::provider::BoxFuture;

pub use tls::{connect_tls, insecure_client_config};

/// Byte stream a connection can run over.
///
/// Implemented for every `AsyncRead + AsyncWrite` stream, so the TLS
/// socket and in-memory test pipes are interchangeable.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Owned, type-erased transport.
pub type BoxedStream = Box<dyn Transport>;

/// Opens byte streams to a Blaze endpoint.
pub trait Connector: Send + Sync {
    /// Dial `host:port`, giving up after `timeout`.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BoxedStream>>;
}

/// Dials TLS over TCP with certificate validation disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsConnector;

impl Connector for TlsConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = connect_tls(host, port, timeout).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
