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
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::cache::{CacheError, FileCache};
use crate::config::{AgentConfig, AgentPaths};
use crate::httpproxy::proxy::{Cacher, Proxy, ProxyError};
use crate::httpproxy::rewrite::{boot_resource_cache_rules, boot_resource_rewriter};
use crate::httpproxy::service::{HttpProxyService, ListenerAddress};
use crate::resolver::conf::ResolvConfError;
use crate::resolver::handler::RecursiveHandler;
use crate::resolver::service::{ResolverService, ServiceError};

/// How long one endpoint reachability probe may take.
pub const ENDPOINT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Reply to `get-region-controller-endpoints`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionEndpoints {
    pub endpoints: Vec<String>,
}

/// Reply to `get-resolver-config`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    pub enabled: bool,
    #[serde(default)]
    pub bind_ips: Vec<String>,
    #[serde(default)]
    pub authoritative_ips: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control plane request failed: {0}")]
    Rpc(String),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    ResolvConf(#[from] ResolvConfError),
    #[error(transparent)]
    Resolver(#[from] ServiceError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The two configuration messages the orchestration runtime answers. The
/// runtime itself, and the encrypted session under it, stay opaque.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_region_controller_endpoints(
        &self,
        system_id: &str,
    ) -> Result<RegionEndpoints, ControlError>;

    async fn get_resolver_config(&self, system_id: &str) -> Result<ResolverConfig, ControlError>;
}

/// File-driven stand-in for the orchestration runtime, used at bootstrap:
/// region endpoints are derived from the configured controller list and the
/// resolver stays disabled until the runtime says otherwise.
pub struct BootstrapControlPlane {
    endpoints: Vec<String>,
}

impl BootstrapControlPlane {
    pub fn from_config(config: &AgentConfig) -> Self {
        BootstrapControlPlane {
            endpoints: config
                .controllers
                .iter()
                .map(|host| format!("http://{host}:5240/MAAS"))
                .collect(),
        }
    }
}

#[async_trait]
impl ControlPlane for BootstrapControlPlane {
    async fn get_region_controller_endpoints(
        &self,
        _system_id: &str,
    ) -> Result<RegionEndpoints, ControlError> {
        Ok(RegionEndpoints {
            endpoints: self.endpoints.clone(),
        })
    }

    async fn get_resolver_config(&self, _system_id: &str) -> Result<ResolverConfig, ControlError> {
        Ok(ResolverConfig {
            enabled: false,
            bind_ips: Vec::new(),
            authoritative_ips: Vec::new(),
        })
    }
}

/// Applies control-plane configuration to the HTTP proxy and resolver
/// services. Both entry points are idempotent: repeated invocations tear
/// down what the previous one started.
pub struct ServiceController {
    control: Arc<dyn ControlPlane>,
    config: AgentConfig,
    proxy_address: ListenerAddress,
    resolv_conf_path: PathBuf,
    handler: Arc<RecursiveHandler>,
    httpproxy: tokio::sync::Mutex<Option<HttpProxyService>>,
    resolver: tokio::sync::Mutex<ResolverService>,
}

impl ServiceController {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        config: AgentConfig,
        paths: &AgentPaths,
        handler: Arc<RecursiveHandler>,
        resolver: ResolverService,
    ) -> Self {
        ServiceController {
            control,
            config,
            proxy_address: ListenerAddress::Unix(paths.httpproxy_socket()),
            resolv_conf_path: PathBuf::from(RESOLV_CONF_PATH),
            handler,
            httpproxy: tokio::sync::Mutex::new(None),
            resolver: tokio::sync::Mutex::new(resolver),
        }
    }

    pub fn with_proxy_address(mut self, address: ListenerAddress) -> Self {
        self.proxy_address = address;
        self
    }

    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf_path = path.into();
        self
    }

    /// Fetches the region endpoints, keeps the reachable ones, and
    /// (re)starts the caching proxy over them on the configured listener.
    pub async fn configure_httpproxy_service(&self, system_id: &str) -> Result<(), ControlError> {
        let reply = self
            .control
            .get_region_controller_endpoints(system_id)
            .await?;
        let mut reachable = Vec::new();
        for endpoint in &reply.endpoints {
            if probe_endpoint(endpoint).await {
                reachable.push(endpoint.clone());
            } else {
                warn!(endpoint = %endpoint, "region endpoint unreachable, skipping");
            }
        }

        let cacher = match (
            &self.config.httpproxy.cache_dir,
            self.config.httpproxy.cache_size,
        ) {
            (Some(dir), Some(size)) => Some(Cacher::new(
                Arc::new(FileCache::new(size, dir.clone())?),
                boot_resource_cache_rules(),
            )),
            _ => None,
        };
        let proxy = Proxy::new(reachable, boot_resource_rewriter(), cacher)?;

        // reconfiguration closes the old listener before opening a new one
        let mut slot = self.httpproxy.lock().await;
        if let Some(previous) = slot.take() {
            previous.shutdown().await;
        }
        let service = HttpProxyService::spawn(Arc::new(proxy), self.proxy_address.clone()).await?;
        info!(system_id, "httpproxy service configured");
        *slot = Some(service);
        Ok(())
    }

    /// Fetches the resolver configuration and either stops the listeners or
    /// installs the new upstream set and rebinds them.
    pub async fn configure_resolver_service(&self, system_id: &str) -> Result<(), ControlError> {
        let reply = self.control.get_resolver_config(system_id).await?;
        let mut resolver = self.resolver.lock().await;
        if !reply.enabled {
            info!(system_id, "resolver disabled, stopping listeners");
            resolver.stop().await;
            return Ok(());
        }
        let mut authoritative = Vec::new();
        for raw in &reply.authoritative_ips {
            match raw.parse::<IpAddr>() {
                Ok(ip) => authoritative.push(ip),
                Err(_) => warn!(address = %raw, "ignoring bad authoritative address"),
            }
        }
        self.handler
            .set_upstreams(&self.resolv_conf_path, authoritative)?;
        resolver.reconfigure(&reply.bind_ips).await?;
        info!(system_id, binds = reply.bind_ips.len(), "resolver service configured");
        Ok(())
    }

    /// The TCP address the proxy listener bound, when it is running on TCP.
    pub async fn httpproxy_addr(&self) -> Option<std::net::SocketAddr> {
        self.httpproxy
            .lock()
            .await
            .as_ref()
            .and_then(HttpProxyService::local_addr)
    }

    pub async fn resolver_running(&self) -> bool {
        self.resolver.lock().await.is_running()
    }
}

// a region endpoint is usable when its host answers a tcp connect quickly
async fn probe_endpoint(endpoint: &str) -> bool {
    let uri: http::Uri = match endpoint.parse() {
        Ok(uri) => uri,
        Err(_) => return false,
    };
    let host = match uri.host() {
        Some(host) => host.to_string(),
        None => return false,
    };
    let port = uri.port_u16().unwrap_or_else(|| {
        if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        }
    });
    matches!(
        tokio::time::timeout(ENDPOINT_PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::client::{ClientError, ResolverClient};
    use crate::resolver::handler::DEFAULT_SESSION_TTL;
    use hickory_proto::op::{Message, MessageType, OpCode};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    struct StaticControl {
        endpoints: Vec<String>,
        resolver: parking_lot::Mutex<ResolverConfig>,
    }

    impl StaticControl {
        fn new(endpoints: Vec<String>, resolver: ResolverConfig) -> Self {
            StaticControl {
                endpoints,
                resolver: parking_lot::Mutex::new(resolver),
            }
        }

        fn disabled_resolver() -> ResolverConfig {
            ResolverConfig {
                enabled: false,
                bind_ips: Vec::new(),
                authoritative_ips: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ControlPlane for StaticControl {
        async fn get_region_controller_endpoints(
            &self,
            _system_id: &str,
        ) -> Result<RegionEndpoints, ControlError> {
            Ok(RegionEndpoints {
                endpoints: self.endpoints.clone(),
            })
        }

        async fn get_resolver_config(
            &self,
            _system_id: &str,
        ) -> Result<ResolverConfig, ControlError> {
            Ok(self.resolver.lock().clone())
        }
    }

    struct NullClient;

    #[async_trait]
    impl ResolverClient for NullClient {
        async fn exchange(
            &self,
            msg: &Message,
            _upstream: SocketAddr,
        ) -> Result<Message, ClientError> {
            let mut response = Message::new();
            response.set_id(msg.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            for query in msg.queries() {
                response.add_query(query.clone());
            }
            Ok(response)
        }
    }

    async fn hello_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
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
        format!("http://{addr}")
    }

    fn controller(
        control: Arc<StaticControl>,
        resolv_conf: Option<&std::path::Path>,
    ) -> ServiceController {
        let handler = Arc::new(RecursiveHandler::new(
            Arc::new(NullClient),
            DEFAULT_SESSION_TTL,
        ));
        let resolver = ResolverService::new(handler.clone()).with_port(0);
        let paths = AgentPaths {
            run_dir: PathBuf::from("/tmp"),
            data_dir: PathBuf::from("/tmp"),
            conf_dir: PathBuf::from("/tmp"),
            cache_dir: PathBuf::from("/tmp"),
        };
        let mut controller = ServiceController::new(
            control,
            AgentConfig::default(),
            &paths,
            handler,
            resolver,
        )
        .with_proxy_address(ListenerAddress::Tcp("127.0.0.1:0".to_string()));
        if let Some(path) = resolv_conf {
            controller = controller.with_resolv_conf(path);
        }
        controller
    }

    #[tokio::test]
    async fn configures_the_proxy_over_reachable_endpoints() {
        let reachable = hello_upstream().await;
        // an endpoint nobody listens on
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            format!("http://{addr}")
        };
        let controller = controller(
            Arc::new(StaticControl::new(
                vec![reachable, dead],
                StaticControl::disabled_resolver(),
            )),
            None,
        );
        controller.configure_httpproxy_service("abc123").await.unwrap();
        let addr = controller.httpproxy_addr().await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /file HTTP/1.1\r\nHost: agent\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.contains("200 OK"));
        assert!(response.contains("hello world"));

        // reconfiguration closes the old listener first
        controller.configure_httpproxy_service("abc123").await.unwrap();
        let second = controller.httpproxy_addr().await.unwrap();
        assert_ne!(addr, second);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn no_reachable_endpoint_is_an_error() {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            format!("http://{addr}")
        };
        let controller = controller(
            Arc::new(StaticControl::new(
                vec![dead],
                StaticControl::disabled_resolver(),
            )),
            None,
        );
        let err = controller
            .configure_httpproxy_service("abc123")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("targets cannot be empty"));
    }

    #[tokio::test]
    async fn enabled_resolver_starts_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let resolv_conf = dir.path().join("resolv.conf");
        std::fs::write(&resolv_conf, "nameserver 10.0.0.1\nsearch maas\n").unwrap();

        let control = Arc::new(StaticControl::new(
            Vec::new(),
            ResolverConfig {
                enabled: true,
                bind_ips: vec!["127.0.0.1".to_string()],
                authoritative_ips: vec!["10.9.9.9".to_string()],
            },
        ));
        let controller = controller(control, Some(&resolv_conf));
        controller.configure_resolver_service("abc123").await.unwrap();
        assert!(controller.resolver_running().await);

        // the listener actually answers
        let addr = controller.resolver.lock().await.bound_addrs()[0].udp;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut query = Message::new();
        query.set_id(7);
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.add_query(hickory_proto::op::Query::query(
            hickory_proto::rr::Name::from_ascii("example.com.").unwrap(),
            hickory_proto::rr::RecordType::A,
        ));
        socket
            .send_to(&query.to_vec().unwrap(), addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; 512];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let response = Message::from_vec(&buf[..len]).unwrap();
        assert_eq!(response.id(), 7);
    }

    #[tokio::test]
    async fn disabling_the_resolver_stops_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let resolv_conf = dir.path().join("resolv.conf");
        std::fs::write(&resolv_conf, "nameserver 10.0.0.1\n").unwrap();

        let control = Arc::new(StaticControl::new(
            Vec::new(),
            ResolverConfig {
                enabled: true,
                bind_ips: vec!["127.0.0.1".to_string()],
                authoritative_ips: Vec::new(),
            },
        ));
        let controller = controller(control.clone(), Some(&resolv_conf));
        controller.configure_resolver_service("abc123").await.unwrap();
        assert!(controller.resolver_running().await);
        let tcp = controller.resolver.lock().await.bound_addrs()[0].tcp;

        // flip the control-plane answer to disabled and reconfigure
        *control.resolver.lock() = StaticControl::disabled_resolver();
        controller.configure_resolver_service("abc123").await.unwrap();
        assert!(!controller.resolver_running().await);
        assert!(tokio::net::TcpStream::connect(tcp).await.is_err());
    }
}
