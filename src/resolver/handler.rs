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
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::resolver::cache::RecordCache;
use crate::resolver::client::{ClientError, ResolverClient};
use crate::resolver::conf::{ResolvConf, ResolvConfError};
use crate::resolver::session::Session;
use crate::resolver::state::QueryState;

pub const DNS_PORT: u16 = 53;

/// Sessions idle longer than this are garbage-collected.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

// byte budget for the record cache
const DEFAULT_RECORD_CACHE_BYTES: usize = 1 << 20;

// zone suffixes owned by the configured authoritative servers
static DEFAULT_AUTHORITATIVE_ZONES: Lazy<Vec<Name>> =
    Lazy::new(|| vec![Name::from_ascii("maas.").expect("static zone name")]);

// the full upstream picture, swapped atomically on reconfiguration
struct Upstreams {
    nameservers: Vec<SocketAddr>,
    search: Vec<Name>,
    authoritative_servers: Vec<SocketAddr>,
    authoritative_zones: Vec<Name>,
    edns0: bool,
    trust_ad: bool,
}

impl Default for Upstreams {
    fn default() -> Self {
        Upstreams {
            nameservers: Vec::new(),
            search: Vec::new(),
            authoritative_servers: Vec::new(),
            authoritative_zones: DEFAULT_AUTHORITATIVE_ZONES.clone(),
            edns0: false,
            trust_ad: false,
        }
    }
}

// outcome of one question's resolution
enum ResolveError {
    Refused,
    NoUpstream,
    Client(ClientError),
}

/// Validating recursive DNS handler.
///
/// Queries are validated, then routed: names under an authoritative zone walk
/// the delegation chain label by label and finish against the configured
/// authoritative servers; everything else goes to the system resolvers, with
/// a search-domain fallback for single-label names. Upstream answers feed the
/// record cache; per-peer sessions track visited names to refuse alias loops.
pub struct RecursiveHandler {
    client: Arc<dyn ResolverClient>,
    cache: RecordCache,
    upstreams: RwLock<Arc<Upstreams>>,
    sessions: Mutex<HashMap<IpAddr, Session>>,
    session_ttl: Duration,
}

impl RecursiveHandler {
    pub fn new(client: Arc<dyn ResolverClient>, session_ttl: Duration) -> Self {
        RecursiveHandler {
            client,
            cache: RecordCache::new(DEFAULT_RECORD_CACHE_BYTES),
            upstreams: RwLock::new(Arc::new(Upstreams::default())),
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
        }
    }

    /// Loads system nameservers and search domains from a resolv.conf style
    /// file and installs them, together with the authoritative server list,
    /// as the new upstream set. In-flight queries finish against the old set.
    pub fn set_upstreams(
        &self,
        resolv_conf_path: impl AsRef<Path>,
        authoritative_servers: Vec<IpAddr>,
    ) -> Result<(), ResolvConfError> {
        let conf = ResolvConf::load(resolv_conf_path)?;
        self.apply_upstreams(conf, authoritative_servers);
        Ok(())
    }

    pub fn apply_upstreams(&self, conf: ResolvConf, authoritative_servers: Vec<IpAddr>) {
        let zones = self.upstreams.read().authoritative_zones.clone();
        let upstreams = Arc::new(Upstreams {
            nameservers: conf
                .nameservers
                .iter()
                .map(|ip| SocketAddr::new(*ip, DNS_PORT))
                .collect(),
            search: conf.search,
            authoritative_servers: authoritative_servers
                .into_iter()
                .map(|ip| SocketAddr::new(ip, DNS_PORT))
                .collect(),
            authoritative_zones: zones,
            edns0: conf.edns0,
            trust_ad: conf.trust_ad,
        });
        debug!(
            nameservers = upstreams.nameservers.len(),
            authoritative = upstreams.authoritative_servers.len(),
            edns0 = upstreams.edns0,
            trust_ad = upstreams.trust_ad,
            "installed new resolver upstreams",
        );
        *self.upstreams.write() = upstreams;
    }

    pub fn set_authoritative_zones(&self, zones: Vec<Name>) {
        let current = self.upstreams.read().clone();
        *self.upstreams.write() = Arc::new(Upstreams {
            nameservers: current.nameservers.clone(),
            search: current.search.clone(),
            authoritative_servers: current.authoritative_servers.clone(),
            authoritative_zones: zones,
            edns0: current.edns0,
            trust_ad: current.trust_ad,
        });
    }

    /// Answers one inbound query from `peer`.
    pub async fn serve(&self, request: &Message, peer: IpAddr) -> Message {
        let mut response = response_stub(request);

        if request.op_code() != OpCode::Query {
            response.set_response_code(ResponseCode::Refused);
            return response;
        }
        for question in request.queries() {
            match question.query_type() {
                RecordType::AXFR | RecordType::IXFR => {
                    response.set_response_code(ResponseCode::Refused);
                    return response;
                }
                RecordType::ANY => {
                    response.set_response_code(ResponseCode::NotImp);
                    return response;
                }
                _ => {}
            }
            match question.query_class() {
                DNSClass::CH | DNSClass::ANY | DNSClass::NONE => {
                    response.set_response_code(ResponseCode::Refused);
                    return response;
                }
                _ => {}
            }
        }

        let upstreams = self.upstreams.read().clone();
        let mut rcode = ResponseCode::NoError;
        for question in request.queries() {
            // answer straight from the record cache when possible
            if let Some(record) = self.cache.get(question.name(), question.query_type()) {
                response.add_answer(record);
                continue;
            }
            let authoritative = upstreams
                .authoritative_zones
                .iter()
                .any(|zone| zone.zone_of(question.name()));
            let result = if authoritative {
                self.resolve_authoritative(question, &upstreams, peer).await
            } else {
                self.resolve_non_authoritative(question, &upstreams).await
            };
            match result {
                Ok(upstream_response) => {
                    self.absorb(&upstream_response);
                    rcode = upstream_response.response_code();
                    for record in upstream_response.answers() {
                        response.add_answer(record.clone());
                    }
                    for record in upstream_response.name_servers() {
                        response.add_name_server(record.clone());
                    }
                    for record in upstream_response.additionals() {
                        response.add_additional(record.clone());
                    }
                }
                Err(ResolveError::Refused) => {
                    response.set_response_code(ResponseCode::Refused);
                    return response;
                }
                Err(ResolveError::NoUpstream) => {
                    warn!("no upstream nameservers configured");
                    response.set_response_code(ResponseCode::ServFail);
                    return response;
                }
                Err(ResolveError::Client(err)) => {
                    warn!(error = %err, name = %question.name(), "upstream exchange failed");
                    response.set_response_code(ResponseCode::ServFail);
                    return response;
                }
            }
        }
        response.set_response_code(rcode);
        response
    }

    // forward to the first system resolver, retrying with each search
    // domain appended when a single-label name comes back NXDOMAIN
    async fn resolve_non_authoritative(
        &self,
        question: &Query,
        upstreams: &Upstreams,
    ) -> Result<Message, ResolveError> {
        let nameserver = *upstreams
            .nameservers
            .first()
            .ok_or(ResolveError::NoUpstream)?;
        let msg = build_query(
            question.name().clone(),
            question.query_type(),
            question.query_class(),
            true,
        );
        let response = self
            .client
            .exchange(&msg, nameserver)
            .await
            .map_err(ResolveError::Client)?;
        if response.response_code() != ResponseCode::NXDomain {
            return Ok(response);
        }
        let state = QueryState::new(question.name().clone());
        if !state.use_search() || upstreams.search.is_empty() {
            return Ok(response);
        }
        let mut last = response;
        for domain in &upstreams.search {
            let candidate = match question.name().clone().append_domain(domain) {
                Ok(name) => name,
                Err(_) => continue,
            };
            debug!(name = %candidate, "retrying with search domain");
            let msg = build_query(
                candidate,
                question.query_type(),
                question.query_class(),
                true,
            );
            let searched = self
                .client
                .exchange(&msg, nameserver)
                .await
                .map_err(ResolveError::Client)?;
            if searched.response_code() == ResponseCode::NoError {
                return Ok(searched);
            }
            last = searched;
        }
        Ok(last)
    }

    // iterative resolution for names inside an authoritative zone,
    // following aliases and refusing loops recorded in the peer session
    async fn resolve_authoritative(
        &self,
        question: &Query,
        upstreams: &Upstreams,
        peer: IpAddr,
    ) -> Result<Message, ResolveError> {
        let mut qname = question.name().clone();
        loop {
            if self.note_queried(peer, &qname) {
                debug!(name = %qname, "alias loop detected, refusing");
                return Err(ResolveError::Refused);
            }
            let response = self.walk_delegations(&qname, question, upstreams).await?;
            if question.query_type() != RecordType::CNAME {
                if let Some(target) = alias_target(&response, &qname, question.query_type()) {
                    debug!(from = %qname, to = %target, "following alias");
                    qname = target;
                    continue;
                }
            }
            return Ok(response);
        }
    }

    // label-by-label walk from the root to the target, learning deeper
    // delegations as it goes; NXDOMAIN along the external chain hands the
    // query to the configured authoritative servers
    async fn walk_delegations(
        &self,
        qname: &Name,
        question: &Query,
        upstreams: &Upstreams,
    ) -> Result<Message, ResolveError> {
        let mut fell_back = upstreams.nameservers.is_empty();
        let mut server = match upstreams.nameservers.first() {
            Some(addr) => *addr,
            None => *upstreams
                .authoritative_servers
                .first()
                .ok_or(ResolveError::NoUpstream)?,
        };
        let mut state = QueryState::new(qname.clone());
        loop {
            let (label, has_more) = state.next_label();
            if has_more {
                let ns_query =
                    build_query(label.clone(), RecordType::NS, question.query_class(), false);
                let response = self
                    .client
                    .exchange(&ns_query, server)
                    .await
                    .map_err(ResolveError::Client)?;
                if response.response_code() == ResponseCode::NXDomain {
                    if !fell_back {
                        if let Some(authoritative) = upstreams.authoritative_servers.first() {
                            debug!(
                                zone = %label,
                                "external delegation chain ended, using authoritative servers",
                            );
                            server = *authoritative;
                            fell_back = true;
                        }
                    }
                    continue;
                }
                self.absorb(&response);
                state.set_last_response(&response);
                if let Some(ns_host) = state.best_ns_target() {
                    if let Some(ip) = self
                        .lookup_host(&ns_host, &response, server, question.query_class())
                        .await
                    {
                        server = SocketAddr::new(ip, DNS_PORT);
                    }
                }
                continue;
            }

            // final label: ask the deepest delegation the real question
            let final_query =
                build_query(label.clone(), question.query_type(), question.query_class(), false);
            let response = self
                .client
                .exchange(&final_query, server)
                .await
                .map_err(ResolveError::Client)?;
            if response.response_code() == ResponseCode::NXDomain && !fell_back {
                if let Some(authoritative) = upstreams.authoritative_servers.first() {
                    let retry = self
                        .client
                        .exchange(&final_query, *authoritative)
                        .await
                        .map_err(ResolveError::Client)?;
                    return Ok(retry);
                }
            }
            return Ok(response);
        }
    }

    // address of a delegation host: glue records first, then the record
    // cache, then a direct A query to the current server
    async fn lookup_host(
        &self,
        host: &Name,
        response: &Message,
        server: SocketAddr,
        qclass: DNSClass,
    ) -> Option<IpAddr> {
        for record in response.additionals() {
            if record.record_type() == RecordType::A && record.name() == host {
                if let Some(RData::A(a)) = record.data() {
                    return Some(IpAddr::V4(a.0));
                }
            }
        }
        if let Some(record) = self.cache.get(host, RecordType::A) {
            if let Some(RData::A(a)) = record.data() {
                return Some(IpAddr::V4(a.0));
            }
        }
        let query = build_query(host.clone(), RecordType::A, qclass, false);
        match self.client.exchange(&query, server).await {
            Ok(response) => {
                self.absorb(&response);
                response.answers().iter().find_map(|record| match record.data() {
                    Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                    _ => None,
                })
            }
            Err(err) => {
                debug!(host = %host, error = %err, "could not resolve delegation host");
                None
            }
        }
    }

    // every record of a successful reply lands in the cache
    fn absorb(&self, response: &Message) {
        for record in response
            .answers()
            .iter()
            .chain(response.name_servers())
            .chain(response.additionals())
        {
            self.cache.set(record);
        }
    }

    // true when this peer's session has already asked about the name
    fn note_queried(&self, peer: IpAddr, name: &Name) -> bool {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(peer).or_default();
        session.seen_before(name)
    }

    /// Drops sessions older than the session TTL.
    pub fn gc_sessions(&self) {
        let ttl = self.session_ttl;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.expired(ttl));
        let dropped = before - sessions.len();
        if dropped > 0 {
            debug!(dropped, remaining = sessions.len(), "collected expired sessions");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

// a response skeleton carrying the original questions
fn response_stub(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

fn build_query(name: Name, qtype: RecordType, qclass: DNSClass, recursion: bool) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(recursion);
    let mut query = Query::query(name, qtype);
    query.set_query_class(qclass);
    msg.add_query(query);
    msg
}

// the CNAME the answer section redirects `qname` to, unless the answer
// already carries a record of the requested type
fn alias_target(response: &Message, qname: &Name, qtype: RecordType) -> Option<Name> {
    let has_final = response
        .answers()
        .iter()
        .any(|record| record.record_type() == qtype);
    if has_final {
        return None;
    }
    response.answers().iter().find_map(|record| {
        if record.record_type() == RecordType::CNAME && record.name() == qname {
            match record.data() {
                Some(RData::CNAME(target)) => Some(target.0.clone()),
                _ => None,
            }
        } else {
            None
        }
    })
}
