/**
 * Copyright (c) 2024-2025 MAAS Developers.
 *
 * This file is part of MAAS Agent
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use http::Request;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::httpproxy::proxy::Proxy;

// group-writable so the fronting web server can reach the socket
const SOCKET_MODE: u32 = 0o660;

// where to serve: a tcp address mainly for tests, a unix socket in
// production where the outer web server connects
#[derive(Clone)]
pub enum ListenerAddress {
    Tcp(String),
    Unix(PathBuf),
}

/// A running HTTP proxy endpoint: one listener plus its accept loop.
///
/// Shutting it down stops the accept loop and, for Unix sockets, removes the
/// socket file so the next bind starts clean.
pub struct HttpProxyService {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    local_addr: Option<SocketAddr>,
    socket_path: Option<PathBuf>,
}

impl HttpProxyService {
    /// Binds the listener and starts accepting proxy connections.
    pub async fn spawn(proxy: Arc<Proxy>, address: ListenerAddress) -> io::Result<Self> {
        let (stop, stopped) = watch::channel(false);
        match address {
            ListenerAddress::Tcp(addr) => {
                let listener = TcpListener::bind(&addr).await?;
                let local_addr = listener.local_addr()?;
                info!(address = %local_addr, "httpproxy listening on tcp");
                let handle = tokio::spawn(accept_tcp(listener, proxy, stopped));
                Ok(HttpProxyService {
                    stop,
                    handle,
                    local_addr: Some(local_addr),
                    socket_path: None,
                })
            }
            ListenerAddress::Unix(path) => {
                // a previous run may have left its socket behind
                match std::fs::remove_file(&path) {
                    Ok(()) => (),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                    Err(err) => return Err(err),
                }
                let listener = UnixListener::bind(&path)?;
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
                }
                info!(path = %path.display(), "httpproxy listening on unix socket");
                let handle = tokio::spawn(accept_unix(listener, proxy, stopped));
                Ok(HttpProxyService {
                    stop,
                    handle,
                    local_addr: None,
                    socket_path: Some(path),
                })
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops the accept loop and waits for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
        if let Some(path) = self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn accept_tcp(listener: TcpListener, proxy: Arc<Proxy>, mut stopped: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stopped.changed() => {
                debug!("httpproxy tcp accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    serve_stream(stream, Some(peer), proxy.clone());
                }
                Err(err) => warn!(error = %err, "failed to accept proxy connection"),
            }
        }
    }
}

async fn accept_unix(listener: UnixListener, proxy: Arc<Proxy>, mut stopped: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stopped.changed() => {
                debug!("httpproxy unix accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                // unix peers carry no usable address for forwarding headers
                Ok((stream, _)) => {
                    serve_stream(stream, None, proxy.clone());
                }
                Err(err) => warn!(error = %err, "failed to accept proxy connection"),
            }
        }
    }
}

// run one downstream connection through hyper's http/1 server machinery
fn serve_stream<S>(stream: S, peer: Option<SocketAddr>, proxy: Arc<Proxy>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            async move {
                let req = req.map(|body| body.map_err(io::Error::other).boxed());
                Ok::<_, Infallible>(proxy.handle(req, peer).await)
            }
        });
        let conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service);
        if let Err(err) = conn.await {
            debug!(error = %err, "proxy connection ended with error");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpproxy::rewrite::Rewriter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UnixStream};

    // canned upstream answering every request with 200 hello world
    async fn upstream() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                hits_counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = sock
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\
                              Connection: close\r\n\r\nhello world",
                        )
                        .await;
                });
            }
        });
        (format!("http://{addr}"), hits)
    }

    async fn request_over<S>(mut stream: S) -> String
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        stream
            .write_all(b"GET /file HTTP/1.1\r\nHost: agent\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn serves_proxy_over_tcp() {
        let (url, _) = upstream().await;
        let proxy = Arc::new(Proxy::new(vec![url], Rewriter::new(Vec::new()), None).unwrap());
        let service = HttpProxyService::spawn(
            proxy,
            ListenerAddress::Tcp("127.0.0.1:0".to_string()),
        )
        .await
        .unwrap();
        let addr = service.local_addr().unwrap();

        let response = request_over(TcpStream::connect(addr).await.unwrap()).await;
        assert!(response.contains("200 OK"));
        assert!(response.contains("hello world"));
        assert!(response.to_lowercase().contains("server: maas-agent"));
        service.shutdown().await;

        // the listener is really gone after shutdown
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn serves_proxy_over_unix_socket() {
        let (url, _) = upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("httpproxy.sock");
        let proxy = Arc::new(Proxy::new(vec![url], Rewriter::new(Vec::new()), None).unwrap());
        let service = HttpProxyService::spawn(proxy, ListenerAddress::Unix(path.clone()))
            .await
            .unwrap();

        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, SOCKET_MODE);
        }

        let response = request_over(UnixStream::connect(&path).await.unwrap()).await;
        assert!(response.contains("200 OK"));
        assert!(response.contains("hello world"));

        service.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rebinding_the_same_socket_path_works() {
        let (url, _) = upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("httpproxy.sock");
        for _ in 0..2 {
            let proxy = Arc::new(
                Proxy::new(vec![url.clone()], Rewriter::new(Vec::new()), None).unwrap(),
            );
            let service = HttpProxyService::spawn(proxy, ListenerAddress::Unix(path.clone()))
                .await
                .unwrap();
            let response = request_over(UnixStream::connect(&path).await.unwrap()).await;
            assert!(response.contains("200 OK"));
            service.shutdown().await;
        }
    }
}
