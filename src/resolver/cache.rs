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
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::rr::{Name, Record, RecordType};
use lru::LruCache;
use parking_lot::Mutex;

// rough upper bound on one stored record, used to turn a byte budget
// into an entry capacity
pub const MAX_RECORD_SIZE: usize = 512;

struct CacheEntry {
    record: Record,
    created: Instant,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.created.elapsed() >= Duration::from_secs(u64::from(self.record.ttl()))
    }
}

/// TTL-aware LRU cache of resource records keyed by owner name and record
/// type. Expired entries are dropped lazily on lookup.
pub struct RecordCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl RecordCache {
    /// Builds a cache sized from a byte budget, holding at least one record.
    pub fn new(max_bytes: usize) -> Self {
        let capacity = (max_bytes / MAX_RECORD_SIZE).max(1);
        RecordCache {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    fn key(name: &Name, record_type: RecordType) -> String {
        format!("{}_{}", name.to_ascii().to_lowercase(), record_type)
    }

    pub fn get(&self, name: &Name, record_type: RecordType) -> Option<Record> {
        let key = Self::key(name, record_type);
        let mut entries = self.entries.lock();
        let expired = match entries.get(&key) {
            None => return None,
            Some(entry) => entry.expired(),
        };
        if expired {
            entries.pop(&key);
            return None;
        }
        entries.get(&key).map(|entry| entry.record.clone())
    }

    pub fn set(&self, record: &Record) {
        let key = Self::key(record.name(), record.record_type());
        self.entries.lock().put(
            key,
            CacheEntry {
                record: record.clone(),
                created: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
