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
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::resolver::handler::{RecursiveHandler, DEFAULT_SESSION_TTL, DNS_PORT};

const UDP_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid bind ip: {0}")]
    InvalidBindIp(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where one bind IP ended up listening; ports differ from the configured
/// one only when binding port zero in tests.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub udp: SocketAddr,
    pub tcp: SocketAddr,
}

/// Front-end for the recursive handler: one UDP and one TCP listener per
/// configured bind IP, a periodic session GC tick, and a shared channel for
/// fatal listener errors.
pub struct ResolverService {
    handler: Arc<RecursiveHandler>,
    port: u16,
    session_ttl: Duration,
    stop: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    bound: Vec<BoundAddrs>,
    errors_tx: mpsc::UnboundedSender<io::Error>,
    errors_rx: Option<mpsc::UnboundedReceiver<io::Error>>,
}

impl ResolverService {
    pub fn new(handler: Arc<RecursiveHandler>) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        ResolverService {
            handler,
            port: DNS_PORT,
            session_ttl: DEFAULT_SESSION_TTL,
            stop: None,
            tasks: Vec::new(),
            bound: Vec::new(),
            errors_tx,
            errors_rx: Some(errors_rx),
        }
    }

    /// Overrides the listening port; tests bind port zero.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Fatal listener errors are delivered here; the receiver can be taken
    /// exactly once.
    pub fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<io::Error>> {
        self.errors_rx.take()
    }

    pub fn bound_addrs(&self) -> &[BoundAddrs] {
        &self.bound
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_some()
    }

    /// Tears down any running listeners and starts a fresh set, one UDP and
    /// one TCP listener per bind IP. Addresses are validated up front so a
    /// bad one leaves nothing half-started.
    pub async fn reconfigure(&mut self, bind_ips: &[String]) -> Result<(), ServiceError> {
        let mut ips = Vec::with_capacity(bind_ips.len());
        for raw in bind_ips {
            let ip: IpAddr = raw
                .trim()
                .parse()
                .map_err(|_| ServiceError::InvalidBindIp(raw.clone()))?;
            ips.push(ip);
        }

        self.stop_listeners().await;

        // install the stop signal first so a failed bind below still
        // leaves the already-spawned loops stoppable
        let (stop, stopped) = watch::channel(false);
        self.stop = Some(stop);
        for ip in ips {
            let udp = UdpSocket::bind((ip, self.port)).await?;
            let tcp = TcpListener::bind((ip, self.port)).await?;
            let bound = BoundAddrs {
                udp: udp.local_addr()?,
                tcp: tcp.local_addr()?,
            };
            info!(udp = %bound.udp, tcp = %bound.tcp, "resolver listening");
            self.bound.push(bound);
            self.tasks.push(tokio::spawn(udp_loop(
                udp,
                self.handler.clone(),
                stopped.clone(),
                self.errors_tx.clone(),
            )));
            self.tasks.push(tokio::spawn(tcp_loop(
                tcp,
                self.handler.clone(),
                stopped.clone(),
                self.errors_tx.clone(),
            )));
        }
        self.tasks.push(tokio::spawn(gc_loop(
            self.handler.clone(),
            self.session_ttl,
            stopped,
        )));
        Ok(())
    }

    /// Stops every listener and the GC ticker.
    pub async fn stop(&mut self) {
        self.stop_listeners().await;
    }

    async fn stop_listeners(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.bound.clear();
    }
}

async fn udp_loop(
    socket: UdpSocket,
    handler: Arc<RecursiveHandler>,
    mut stopped: watch::Receiver<bool>,
    errors: mpsc::UnboundedSender<io::Error>,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        tokio::select! {
            _ = stopped.changed() => {
                debug!("resolver udp loop stopping");
                break;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    let packet = buf[..len].to_vec();
                    let handler = handler.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        let request = match Message::from_vec(&packet) {
                            Ok(request) => request,
                            Err(err) => {
                                debug!(error = %err, %peer, "dropping malformed udp query");
                                return;
                            }
                        };
                        let response = handler.serve(&request, peer.ip()).await;
                        match response.to_vec() {
                            Ok(bytes) => {
                                let _ = socket.send_to(&bytes, peer).await;
                            }
                            Err(err) => warn!(error = %err, "could not encode response"),
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "udp listener failed");
                    let _ = errors.send(err);
                    break;
                }
            }
        }
    }
}

async fn tcp_loop(
    listener: TcpListener,
    handler: Arc<RecursiveHandler>,
    mut stopped: watch::Receiver<bool>,
    errors: mpsc::UnboundedSender<io::Error>,
) {
    loop {
        tokio::select! {
            _ = stopped.changed() => {
                debug!("resolver tcp loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(serve_tcp(stream, peer, handler));
                }
                Err(err) => {
                    warn!(error = %err, "tcp listener failed");
                    let _ = errors.send(err);
                    break;
                }
            }
        }
    }
}

// one tcp connection can carry many length-prefixed queries in sequence
async fn serve_tcp(mut stream: TcpStream, peer: SocketAddr, handler: Arc<RecursiveHandler>) {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = usize::from(u16::from_be_bytes(len_buf));
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let request = match Message::from_vec(&body) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, %peer, "dropping malformed tcp query");
                return;
            }
        };
        let response = handler.serve(&request, peer.ip()).await;
        let bytes = match response.to_vec() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "could not encode response");
                return;
            }
        };
        if bytes.len() > usize::from(u16::MAX) {
            warn!("response does not fit a tcp frame");
            return;
        }
        let mut framed = (bytes.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&bytes);
        if stream.write_all(&framed).await.is_err() {
            return;
        }
    }
}

async fn gc_loop(
    handler: Arc<RecursiveHandler>,
    session_ttl: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    // a zero ttl would spin the ticker
    let period = session_ttl.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            _ = ticker.tick() => handler.gc_sessions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::client::{ClientError, ResolverClient};
    use async_trait::async_trait;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    // stub upstream answering every question with a fixed A record
    struct StaticClient;

    #[async_trait]
    impl ResolverClient for StaticClient {
        async fn exchange(
            &self,
            msg: &Message,
            _upstream: SocketAddr,
        ) -> Result<Message, ClientError> {
            let query = msg.queries()[0].clone();
            let mut response = Message::new();
            response.set_id(msg.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            response.add_answer(Record::from_rdata(
                query.name().clone(),
                30,
                RData::A(A::new(10, 0, 0, 1)),
            ));
            response.add_query(query);
            Ok(response)
        }
    }

    fn test_handler() -> Arc<RecursiveHandler> {
        let handler = RecursiveHandler::new(Arc::new(StaticClient), DEFAULT_SESSION_TTL);
        let mut conf = crate::resolver::conf::ResolvConf::default();
        conf.nameservers = vec!["10.0.0.1".parse().unwrap()];
        handler.apply_upstreams(conf, Vec::new());
        Arc::new(handler)
    }

    fn query_bytes(qname: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(99);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(
            Name::from_ascii(qname).unwrap(),
            RecordType::A,
        ));
        msg.to_vec().unwrap()
    }

    fn test_handler_arc(handler: RecursiveHandler) -> Arc<RecursiveHandler> {
        Arc::new(handler)
    }

    #[tokio::test]
    async fn invalid_bind_ip_is_rejected() {
        let mut service = ResolverService::new(test_handler()).with_port(0);
        let err = service
            .reconfigure(&["not-an-ip".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidBindIp(ip) if ip == "not-an-ip"));
        assert!(!service.is_running());
        assert!(service.bound_addrs().is_empty());
    }

    #[tokio::test]
    async fn answers_over_udp() {
        let mut service = ResolverService::new(test_handler()).with_port(0);
        service
            .reconfigure(&["127.0.0.1".to_string()])
            .await
            .unwrap();
        let addr = service.bound_addrs()[0].udp;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&query_bytes("example.com."), addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let response = Message::from_vec(&buf[..len]).unwrap();
        assert_eq!(response.id(), 99);
        assert!(response.recursion_available());
        assert_eq!(response.answers().len(), 1);

        service.stop().await;
    }

    #[tokio::test]
    async fn answers_over_tcp() {
        let mut service = ResolverService::new(test_handler()).with_port(0);
        service
            .reconfigure(&["127.0.0.1".to_string()])
            .await
            .unwrap();
        let addr = service.bound_addrs()[0].tcp;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let query = query_bytes("example.com.");
        let mut framed = (query.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&query);
        stream.write_all(&framed).await.unwrap();

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = usize::from(u16::from_be_bytes(len_buf));
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        let response = Message::from_vec(&body).unwrap();
        assert_eq!(response.answers().len(), 1);

        service.stop().await;
    }

    #[tokio::test]
    async fn reconfigure_replaces_the_listeners() {
        let mut service = ResolverService::new(test_handler()).with_port(0);
        service
            .reconfigure(&["127.0.0.1".to_string()])
            .await
            .unwrap();
        let first_tcp = service.bound_addrs()[0].tcp;

        service
            .reconfigure(&["127.0.0.1".to_string()])
            .await
            .unwrap();
        let second_tcp = service.bound_addrs()[0].tcp;
        assert_ne!(first_tcp, second_tcp);
        // the old tcp listener is gone
        assert!(TcpStream::connect(first_tcp).await.is_err());

        service.stop().await;
        assert!(!service.is_running());
        assert!(TcpStream::connect(second_tcp).await.is_err());
    }

    #[tokio::test]
    async fn gc_ticker_collects_expired_sessions() {
        let handler = test_handler_arc({
            let handler = RecursiveHandler::new(Arc::new(StaticClient), Duration::from_millis(20));
            let mut conf = crate::resolver::conf::ResolvConf::default();
            conf.nameservers = vec!["10.0.0.1".parse().unwrap()];
            handler.apply_upstreams(conf, Vec::new());
            handler.set_authoritative_zones(vec![Name::from_ascii("example.com.").unwrap()]);
            handler
        });
        let mut service = ResolverService::new(handler.clone())
            .with_port(0)
            .with_session_ttl(Duration::from_millis(20));
        service
            .reconfigure(&["127.0.0.1".to_string()])
            .await
            .unwrap();
        let addr = service.bound_addrs()[0].udp;

        // an authoritative query creates a session for this peer
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&query_bytes("www.example.com."), addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(handler.session_count(), 1);

        // the ticker fires once the ttl elapses
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handler.session_count(), 0);

        service.stop().await;
    }
}
