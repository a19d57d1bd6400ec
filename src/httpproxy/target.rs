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
use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

// consecutive failures before a target is demoted
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

// probability of picking from the reliable set when both sets are populated,
// the remaining share probes demoted targets for recovery
const RELIABLE_BIAS: f64 = 0.95;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("targets cannot be empty")]
    EmptyTargets,
}

#[derive(Debug)]
struct TargetRecord {
    url: String,
    failures: u32,
}

#[derive(Debug)]
struct TargetSets {
    reliable: Vec<TargetRecord>,
    unreliable: Vec<TargetRecord>,
}

/// Tracks which upstream targets are currently trustworthy.
///
/// Every target lives in exactly one of two sets. Reaching
/// [`MAX_CONSECUTIVE_FAILURES`] consecutive failures moves it to the
/// unreliable set; a single success moves it back. Selection is weighted so
/// that demoted targets still receive the occasional probing request.
#[derive(Debug)]
pub struct TargetSelector {
    sets: RwLock<TargetSets>,
}

impl TargetSelector {
    pub fn new(targets: impl IntoIterator<Item = String>) -> Result<Self, TargetError> {
        let reliable: Vec<TargetRecord> = targets
            .into_iter()
            .map(|url| TargetRecord { url, failures: 0 })
            .collect();
        if reliable.is_empty() {
            return Err(TargetError::EmptyTargets);
        }
        Ok(TargetSelector {
            sets: RwLock::new(TargetSets {
                reliable,
                unreliable: Vec::new(),
            }),
        })
    }

    /// Picks a target not present in `excluding`, preferring the reliable
    /// set. Returns `None` when every target is excluded.
    pub fn select(&self, excluding: &[String]) -> Option<String> {
        let sets = self.sets.read();
        let prefer_reliable = rand::thread_rng().gen::<f64>() < RELIABLE_BIAS;
        let (first, second) = if prefer_reliable {
            (&sets.reliable, &sets.unreliable)
        } else {
            (&sets.unreliable, &sets.reliable)
        };
        pick(first, excluding).or_else(|| pick(second, excluding))
    }

    /// Resets the failure count and promotes the target when it was demoted.
    /// Unknown targets are ignored.
    pub fn record_success(&self, url: &str) {
        let mut sets = self.sets.write();
        if let Some(record) = sets.reliable.iter_mut().find(|r| r.url == url) {
            record.failures = 0;
            return;
        }
        if let Some(pos) = sets.unreliable.iter().position(|r| r.url == url) {
            let mut record = sets.unreliable.remove(pos);
            record.failures = 0;
            debug!(target = url, "upstream recovered, promoting");
            sets.reliable.push(record);
        }
    }

    /// Counts one more consecutive failure, demoting the target once the
    /// threshold is reached. Failures on unknown or already-demoted targets
    /// are ignored.
    pub fn record_failure(&self, url: &str) {
        let mut sets = self.sets.write();
        if let Some(pos) = sets.reliable.iter().position(|r| r.url == url) {
            sets.reliable[pos].failures += 1;
            if sets.reliable[pos].failures >= MAX_CONSECUTIVE_FAILURES {
                let record = sets.reliable.remove(pos);
                debug!(target = url, "upstream demoted to unreliable");
                sets.unreliable.push(record);
            }
        }
    }

    pub fn reliable(&self) -> Vec<String> {
        self.sets
            .read()
            .reliable
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn unreliable(&self) -> Vec<String> {
        self.sets
            .read()
            .unreliable
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }
}

fn pick(records: &[TargetRecord], excluding: &[String]) -> Option<String> {
    let candidates: Vec<&TargetRecord> = records
        .iter()
        .filter(|r| !excluding.contains(&r.url))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[idx].url.clone())
}
