//! Pipe endpoints for shim traffic.
//!
//! [`PipeAddr`] names an endpoint; this module realizes it. On Windows the
//! address resolves under the named-pipe namespace; on Unix it becomes a
//! socket inside the runtime's pipe directory.

use std::path::Path;

use hcslite_shared::{HcsliteError, HcsliteResult, PipeAddr};

#[cfg(unix)]
mod imp {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};

    pub type PipeStream = UnixStream;

    pub struct PipeListener {
        inner: UnixListener,
        path: PathBuf,
    }

    impl PipeListener {
        pub async fn bind(addr: &PipeAddr, pipe_dir: &Path) -> HcsliteResult<Self> {
            tokio::fs::create_dir_all(pipe_dir).await?;
            let path = addr.to_path(pipe_dir);
            // A previous owner may have died without cleaning up.
            if path.exists() {
                let _ = tokio::fs::remove_file(&path).await;
            }
            let inner = UnixListener::bind(&path).map_err(|e| {
                HcsliteError::Io(format!("binding {}: {}", path.display(), e))
            })?;
            Ok(Self { inner, path })
        }

        pub async fn accept(&mut self) -> HcsliteResult<PipeStream> {
            let (stream, _) = self.inner.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub async fn connect(addr: &PipeAddr, pipe_dir: &Path) -> HcsliteResult<PipeStream> {
        let path = addr.to_path(pipe_dir);
        UnixStream::connect(&path).await.map_err(|e| {
            HcsliteError::Io(format!("connecting {}: {}", path.display(), e))
        })
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

    pub enum PipeStream {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(s) => Pin::new(s).poll_read(cx, buf),
                PipeStream::Client(c) => Pin::new(c).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            match self.get_mut() {
                PipeStream::Server(s) => Pin::new(s).poll_write(cx, buf),
                PipeStream::Client(c) => Pin::new(c).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(s) => Pin::new(s).poll_flush(cx),
                PipeStream::Client(c) => Pin::new(c).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(s) => Pin::new(s).poll_shutdown(cx),
                PipeStream::Client(c) => Pin::new(c).poll_shutdown(cx),
            }
        }
    }

    pub struct PipeListener {
        path: String,
        next: Option<NamedPipeServer>,
    }

    impl PipeListener {
        pub async fn bind(addr: &PipeAddr, pipe_dir: &Path) -> HcsliteResult<Self> {
            let path = addr.to_path(pipe_dir).to_string_lossy().into_owned();
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&path)
                .map_err(|e| HcsliteError::Io(format!("creating pipe {}: {}", path, e)))?;
            Ok(Self {
                path,
                next: Some(first),
            })
        }

        pub async fn accept(&mut self) -> HcsliteResult<PipeStream> {
            let server = match self.next.take() {
                Some(server) => server,
                None => ServerOptions::new()
                    .create(&self.path)
                    .map_err(|e| HcsliteError::Io(format!("creating pipe {}: {}", self.path, e)))?,
            };
            server.connect().await?;
            Ok(PipeStream::Server(server))
        }
    }

    pub async fn connect(addr: &PipeAddr, pipe_dir: &Path) -> HcsliteResult<PipeStream> {
        let path = addr.to_path(pipe_dir).to_string_lossy().into_owned();
        let client = ClientOptions::new()
            .open(&path)
            .map_err(|e| HcsliteError::Io(format!("connecting {}: {}", path, e)))?;
        Ok(PipeStream::Client(client))
    }
}

pub use imp::{PipeListener, PipeStream, connect};

/// Bind a listener for `addr`.
pub async fn listen(addr: &PipeAddr, pipe_dir: &Path) -> HcsliteResult<PipeListener> {
    PipeListener::bind(addr, pipe_dir).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hcslite_shared::protocol::{self, ShimOp, ShimRequest};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn request_and_response_cross_the_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let addr = PipeAddr::vmshim("vm-1");
        let mut listener = listen(&addr, dir.path()).await.unwrap();

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let request: ShimRequest = protocol::read_message(&mut stream).await.unwrap();
            assert_eq!(request.op, ShimOp::CreateContainer);
            protocol::write_success(&mut stream).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = connect(&addr, dir.path()).await.unwrap();
        protocol::write_message(
            &mut stream,
            &ShimRequest {
                id: "c1".into(),
                op: ShimOp::CreateContainer,
            },
        )
        .await
        .unwrap();
        stream.shutdown().await.unwrap();
        protocol::read_response(&mut stream).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stale_sockets_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let addr = PipeAddr::shim("c1");
        let first = listen(&addr, dir.path()).await.unwrap();
        drop(first);
        // Binding again over a leftover path succeeds.
        let _second = listen(&addr, dir.path()).await.unwrap();
    }
}
