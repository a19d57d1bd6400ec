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
use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RData, Record, RecordType};

/// Hard bound on the label walk of a single query.
pub const MAX_RECURSION_DEPTH: usize = 127;

/// Transient state for one in-flight query: the label-by-label walk from the
/// root towards the target name, plus the most specific delegation seen.
pub struct QueryState {
    target: Name,
    emitted: usize,
    steps: usize,
    current: Name,
    best_ns: Option<Record>,
}

impl QueryState {
    pub fn new(target: Name) -> Self {
        QueryState {
            target,
            emitted: 0,
            steps: 0,
            current: Name::root(),
            best_ns: None,
        }
    }

    /// Walks one step outward from the root: for `example.com.` successive
    /// calls yield `.`, `com.`, `example.com.`. The second element is false
    /// on the final label and once the recursion depth budget is spent.
    pub fn next_label(&mut self) -> (Name, bool) {
        let total = self.target.num_labels() as usize;
        if self.steps >= MAX_RECURSION_DEPTH || self.emitted > total {
            return (self.current.clone(), false);
        }
        self.steps += 1;
        let name = suffix(&self.target, self.emitted);
        self.current = name.clone();
        self.emitted += 1;
        let has_more = self.emitted <= total && self.steps < MAX_RECURSION_DEPTH;
        (name, has_more)
    }

    pub fn current(&self) -> &Name {
        &self.current
    }

    /// Records a response along the walk, keeping the NS record with the
    /// deepest owner name as the delegation to target next.
    pub fn set_last_response(&mut self, response: &Message) {
        for record in response
            .answers()
            .iter()
            .chain(response.name_servers())
            .chain(response.additionals())
        {
            if record.record_type() != RecordType::NS {
                continue;
            }
            let deeper = match &self.best_ns {
                None => true,
                Some(best) => record.name().num_labels() > best.name().num_labels(),
            };
            if deeper {
                self.best_ns = Some(record.clone());
            }
        }
    }

    pub fn best_ns(&self) -> Option<&Record> {
        self.best_ns.as_ref()
    }

    /// The host name of the most specific delegation server, when one has
    /// been learned.
    pub fn best_ns_target(&self) -> Option<Name> {
        match self.best_ns.as_ref().and_then(Record::data) {
            Some(RData::NS(ns)) => Some(ns.0.clone()),
            _ => None,
        }
    }

    /// Search-domain suffixing only applies to single-label names.
    pub fn use_search(&self) -> bool {
        self.target.num_labels() == 1
    }
}

// the rightmost `count` labels of a name, as a fully qualified name;
// zero labels is the root
fn suffix(name: &Name, count: usize) -> Name {
    let labels: Vec<&[u8]> = name.iter().collect();
    let skip = labels.len().saturating_sub(count);
    let mut out = match Name::from_labels(labels.into_iter().skip(skip)) {
        Ok(name) => name,
        Err(_) => Name::root(),
    };
    out.set_fqdn(true);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::NS;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    #[test]
    fn walks_from_root_to_target() {
        let mut state = QueryState::new(name("example.com."));
        assert_eq!(state.next_label(), (name("."), true));
        assert_eq!(state.next_label(), (name("com."), true));
        assert_eq!(state.next_label(), (name("example.com."), false));
        assert_eq!(state.current(), &name("example.com."));
    }

    #[test]
    fn root_target_is_a_single_step() {
        let mut state = QueryState::new(Name::root());
        let (label, has_more) = state.next_label();
        assert!(label.is_root());
        assert!(!has_more);
    }

    #[test]
    fn walk_is_bounded_by_the_recursion_depth() {
        // 127 single-character labels, the deepest name that still fits
        // in 255 octets; the full walk would need 128 steps
        let deep = vec!["a"; 127].join(".") + ".";
        let target = name(&deep);
        let mut state = QueryState::new(target.clone());
        let mut steps = 0;
        loop {
            let (_, has_more) = state.next_label();
            steps += 1;
            if !has_more {
                break;
            }
            assert!(steps <= MAX_RECURSION_DEPTH, "walk exceeded the bound");
        }
        assert_eq!(steps, MAX_RECURSION_DEPTH);
        // the budget ran out before the target label was reached
        assert_ne!(state.current(), &target);
        // further calls stay put
        let (label, has_more) = state.next_label();
        assert!(!has_more);
        assert_eq!(&label, state.current());
    }

    #[test]
    fn tracks_the_most_specific_delegation() {
        let mut state = QueryState::new(name("www.example.com."));
        let mut shallow = Message::new();
        shallow.add_name_server(Record::from_rdata(
            name("com."),
            300,
            RData::NS(NS(name("ns.gtld."))),
        ));
        state.set_last_response(&shallow);
        assert_eq!(state.best_ns_target().unwrap(), name("ns.gtld."));

        let mut deeper = Message::new();
        deeper.add_name_server(Record::from_rdata(
            name("example.com."),
            300,
            RData::NS(NS(name("ns1.example.com."))),
        ));
        state.set_last_response(&deeper);
        assert_eq!(state.best_ns_target().unwrap(), name("ns1.example.com."));

        // a shallower delegation afterwards does not win
        state.set_last_response(&shallow);
        assert_eq!(state.best_ns_target().unwrap(), name("ns1.example.com."));
    }

    #[test]
    fn search_eligibility_is_single_label_only() {
        assert!(QueryState::new(name("example.")).use_search());
        assert!(!QueryState::new(name("example.com.")).use_search());
        assert!(!QueryState::new(Name::root()).use_search());
    }
}
