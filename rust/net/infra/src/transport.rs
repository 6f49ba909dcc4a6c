//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::AsyncDuplexStream;

/// Opens plain TCP sockets.
///
/// Connection plans dial through this so that tests can script which
/// addresses accept, refuse or hang.
#[async_trait]
pub trait SocketConnector: Debug + Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<Box<dyn AsyncDuplexStream>>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TokioSocketConnector;

#[async_trait]
impl SocketConnector for TokioSocketConnector {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<Box<dyn AsyncDuplexStream>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn connects_to_a_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("can bind");
        let addr = listener.local_addr().expect("bound");

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accepts");
            socket.write_all(b"hi").await.expect("writes");
        });

        let mut stream = TokioSocketConnector.connect(addr).await.expect("connects");
        let mut buf = [0; 2];
        stream.read_exact(&mut buf).await.expect("reads");
        assert_eq!(&buf, b"hi");
        accept.await.expect("no panic");
    }
}
