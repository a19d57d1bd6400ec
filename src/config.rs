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
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable pointing at the agent configuration file.
pub const CONFIG_PATH_ENV: &str = "MAAS_AGENT_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/maas/agent.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpProxyConfig {
    /// Directory backing the on-disk boot-resource cache.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Cache byte budget.
    #[serde(default)]
    pub cache_size: Option<i64>,
}

/// The bootstrap configuration record, normally read from
/// `/etc/maas/agent.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub maas_uuid: Option<String>,
    #[serde(default)]
    pub system_id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub httpproxy: HttpProxyConfig,
    /// Region controller hostnames or addresses.
    #[serde(default)]
    pub controllers: Vec<String>,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// The effective log level; unknown or empty values fall back to info.
    pub fn log_level(&self) -> &'static str {
        match self.log_level.as_deref() {
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        }
    }
}

/// Path of the configuration file, honoring the environment override.
pub fn config_path() -> PathBuf {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

/// Well-known directories the agent works in, snap-confined when the snap
/// environment is present and distro defaults otherwise.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub run_dir: PathBuf,
    pub data_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl AgentPaths {
    pub fn detect() -> Self {
        Self::from_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    // env access goes through a closure so tests can script it
    fn from_env(get: impl Fn(&str) -> Option<String>) -> Self {
        let snap = get("SNAP_INSTANCE_NAME");
        let snap_data = get("SNAP_DATA");
        let snap_common = get("SNAP_COMMON");
        match (snap, snap_data, snap_common) {
            (Some(_), Some(data), Some(common)) => {
                let data = PathBuf::from(data);
                AgentPaths {
                    run_dir: data.join("run"),
                    conf_dir: data.clone(),
                    data_dir: data,
                    cache_dir: PathBuf::from(common).join("cache"),
                }
            }
            _ => AgentPaths {
                run_dir: PathBuf::from("/run/maas"),
                data_dir: PathBuf::from("/var/lib/maas"),
                conf_dir: PathBuf::from("/etc/maas"),
                cache_dir: PathBuf::from("/var/cache/maas"),
            },
        }
    }

    /// Unix socket the outer web server proxies boot traffic to.
    pub fn httpproxy_socket(&self) -> PathBuf {
        self.run_dir.join("httpproxy.sock")
    }
}
