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
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::pool::{ConnPool, PoolError};

// idle connections kept per upstream address
pub const DEFAULT_CONN_POOL_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("dns wire error: {0}")]
    Proto(#[from] ProtoError),
    #[error("upstream exchange timed out")]
    Timeout,
    #[error("message does not fit a dns frame")]
    Oversized,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub dial_timeout: Duration,
    pub exchange_timeout: Duration,
    /// Largest UDP payload the service answers with before truncation.
    pub udp_payload_size: u16,
    pub pool_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            dial_timeout: Duration::from_secs(5),
            exchange_timeout: Duration::from_secs(10),
            udp_payload_size: 4096,
            pool_size: DEFAULT_CONN_POOL_SIZE,
        }
    }
}

/// Transport used by the recursive handler to talk to upstream servers.
/// Abstract so tests can swap in a scripted upstream.
#[async_trait]
pub trait ResolverClient: Send + Sync {
    async fn exchange(&self, msg: &Message, upstream: SocketAddr) -> Result<Message, ClientError>;
}

/// The production client: one connection pool per upstream address, DNS
/// messages framed over TCP with the usual two-byte length prefix.
pub struct PooledClient {
    config: ClientConfig,
    pools: Mutex<HashMap<SocketAddr, ConnPool<TcpStream>>>,
}

impl PooledClient {
    pub fn new(config: ClientConfig) -> Self {
        PooledClient {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool_for(&self, upstream: SocketAddr) -> Result<ConnPool<TcpStream>, PoolError> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&upstream) {
            return Ok(pool.clone());
        }
        let dial_timeout = self.config.dial_timeout;
        let pool = ConnPool::new(self.config.pool_size, move || dial(upstream, dial_timeout))?;
        pools.insert(upstream, pool.clone());
        debug!(%upstream, "created upstream connection pool");
        Ok(pool)
    }

    async fn exchange_with_conn(
        msg: &Message,
        conn: &mut TcpStream,
    ) -> Result<Message, ClientError> {
        let bytes = msg.to_vec()?;
        if bytes.len() > usize::from(u16::MAX) {
            return Err(ClientError::Oversized);
        }
        let mut framed = Vec::with_capacity(bytes.len() + 2);
        framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        framed.extend_from_slice(&bytes);
        conn.write_all(&framed).await?;

        let mut len_buf = [0u8; 2];
        conn.read_exact(&mut len_buf).await?;
        let len = usize::from(u16::from_be_bytes(len_buf));
        let mut body = vec![0u8; len];
        conn.read_exact(&mut body).await?;
        Ok(Message::from_vec(&body)?)
    }
}

async fn dial(upstream: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(upstream)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")),
    }
}

#[async_trait]
impl ResolverClient for PooledClient {
    async fn exchange(&self, msg: &Message, upstream: SocketAddr) -> Result<Message, ClientError> {
        let pool = self.pool_for(upstream)?;
        let mut conn = pool.get().await?;
        let exchange = Self::exchange_with_conn(msg, &mut conn);
        match tokio::time::timeout(self.config.exchange_timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                // a broken exchange poisons the connection
                conn.mark_unusable();
                Err(err)
            }
            Err(_) => {
                conn.mark_unusable();
                Err(ClientError::Timeout)
            }
        }
    }
}
