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
use std::path::Path;

use hickory_proto::rr::Name;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolvConfError {
    #[error("invalid resolv.conf: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The subset of resolv.conf the resolver understands: system nameservers,
/// search domains, and the edns0 / trust-ad option flags. Unrecognized
/// directives are ignored.
#[derive(Debug, Clone, Default)]
pub struct ResolvConf {
    pub nameservers: Vec<IpAddr>,
    pub search: Vec<Name>,
    pub edns0: bool,
    pub trust_ad: bool,
}

impl ResolvConf {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ResolvConfError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self, ResolvConfError> {
        let mut conf = ResolvConf::default();
        for line in content.lines() {
            // strip comments, both # and ; start one
            let line = line
                .split(['#', ';'])
                .next()
                .unwrap_or_default()
                .trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let directive = match fields.next() {
                Some(directive) => directive,
                None => continue,
            };
            let args: Vec<&str> = fields.collect();
            match directive {
                "nameserver" => {
                    let arg = args.first().ok_or_else(|| {
                        ResolvConfError::Invalid("nameserver without an address".to_string())
                    })?;
                    let ip: IpAddr = arg.parse().map_err(|_| {
                        ResolvConfError::Invalid(format!("bad nameserver address {arg}"))
                    })?;
                    conf.nameservers.push(ip);
                }
                "search" => {
                    if args.is_empty() {
                        return Err(ResolvConfError::Invalid(
                            "search without any domain".to_string(),
                        ));
                    }
                    for domain in args {
                        let mut name = Name::from_ascii(domain).map_err(|_| {
                            ResolvConfError::Invalid(format!("bad search domain {domain}"))
                        })?;
                        name.set_fqdn(true);
                        conf.search.push(name);
                    }
                }
                "options" => {
                    for option in args {
                        match option {
                            "edns0" => conf.edns0 = true,
                            "trust-ad" => conf.trust_ad = true,
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(conf)
    }
}
