/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! The active query set and its re-broadcast schedule.
//!
//! Queries are keyed by the caller's query identifier. All active queries are
//! re-broadcast together on an exponential back-off schedule (1.5 s doubling
//! up to an hour); registering new query records resets the schedule and
//! requests an immediate broadcast. Known answers accumulated per query are
//! carried in every broadcast for known-answer suppression.

use embassy_time::{Duration, Instant};

use log::debug;

use crate::error::{Error, ErrorCode};
use crate::proto::{DnsName, DnsQuery, DnsRecord};

/// The maximum number of concurrently active query ids
pub const MAX_ACTIVE_QUERIES: usize = 8;

/// The maximum number of question records per active query id
pub const MAX_QUERIES_PER_ENTRY: usize = 8;

/// The maximum number of known answers retained per active query id
pub const MAX_KNOWN_ANSWERS: usize = 16;

/// The maximum number of questions marshalled into one broadcast round
pub const MAX_BROADCAST_QUERIES: usize = 16;

/// The maximum number of known answers marshalled into one broadcast round
pub const MAX_BROADCAST_ANSWERS: usize = 32;

/// The interval to the first re-broadcast after (re-)registering queries
const INITIAL_INTERVAL: Duration = Duration::from_millis(1500);

/// The back-off cap
const MAX_INTERVAL: Duration = Duration::from_secs(3600);

/// The queries being (re-)broadcast for one query identifier, together with
/// the known answers submitted for suppression on the next broadcast
#[derive(Debug)]
pub struct ActiveQuery {
    pub query_id: DnsName,
    pub queries: heapless::Vec<DnsQuery, MAX_QUERIES_PER_ENTRY>,
    pub answers: heapless::Vec<DnsRecord, MAX_KNOWN_ANSWERS>,
}

/// What the broadcast driver is to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastPoll {
    /// No active queries; park until the set changes
    Idle,
    /// Broadcast now (the schedule has been advanced already)
    Broadcast,
    /// Sleep until the given deadline (or until the set changes)
    SleepUntil(Instant),
}

/// Everything to be marshalled into one broadcast round
#[derive(Debug, Default)]
pub struct BroadcastSnapshot {
    pub queries: heapless::Vec<DnsQuery, MAX_BROADCAST_QUERIES>,
    pub answers: heapless::Vec<DnsRecord, MAX_BROADCAST_ANSWERS>,
}

pub struct QuerySet {
    active: heapless::Vec<ActiveQuery, MAX_ACTIVE_QUERIES>,
    interval: Duration,
    next_at: Option<Instant>,
    broadcast_pending: bool,
}

impl Default for QuerySet {
    fn default() -> Self {
        Self::new()
    }
}

impl QuerySet {
    pub const fn new() -> Self {
        Self {
            active: heapless::Vec::new(),
            interval: INITIAL_INTERVAL,
            next_at: None,
            broadcast_pending: false,
        }
    }

    /// Register query records under the given query identifier.
    ///
    /// Queries equal in name and record type to ones already registered under
    /// the id are not re-added; when nothing new remains, the call is a no-op
    /// and no re-broadcast is scheduled (the caller still awaits its waiter).
    /// Otherwise the fresh queries are merged, the known answers appended
    /// (the answer list is append-only and may contain duplicates), the
    /// back-off is reset to the initial interval and an immediate broadcast
    /// is requested.
    ///
    /// Returns whether the broadcast schedule was touched - the caller wakes
    /// the broadcast driver in that case.
    pub fn set_query_records(
        &mut self,
        query_id: &str,
        queries: &[DnsQuery],
        known_answers: &[DnsRecord],
    ) -> Result<bool, Error> {
        if let Some(entry) = self.active.iter_mut().find(|e| e.query_id == query_id) {
            let mut fresh = heapless::Vec::<_, MAX_QUERIES_PER_ENTRY>::new();

            for query in queries {
                if !entry.queries.contains(query) && !fresh.contains(query) {
                    let _ = fresh.push(query.clone());
                }
            }

            if fresh.is_empty() {
                return Ok(false);
            }

            for query in fresh {
                if entry.queries.push(query).is_err() {
                    debug!("Query list for {} full, dropping a question", query_id);
                }
            }

            Self::append_answers(entry, known_answers);
        } else {
            let mut entry = ActiveQuery {
                query_id: query_id.try_into().map_err(|_| ErrorCode::InvalidArgument)?,
                queries: heapless::Vec::new(),
                answers: heapless::Vec::new(),
            };

            for query in queries {
                if entry.queries.push(query.clone()).is_err() {
                    debug!("Query list for {} full, dropping a question", query_id);
                }
            }

            Self::append_answers(&mut entry, known_answers);

            self.active.push(entry).map_err(|_| ErrorCode::NoSpace)?;
        }

        self.interval = INITIAL_INTERVAL;
        self.broadcast_pending = true;

        Ok(true)
    }

    fn append_answers(entry: &mut ActiveQuery, known_answers: &[DnsRecord]) {
        for answer in known_answers {
            if entry.answers.push(answer.clone()).is_err() {
                debug!(
                    "Known-answer list for {} full, dropping an answer",
                    entry.query_id
                );
            }
        }
    }

    /// Drop the queries registered under the given id; with the last entry
    /// gone, the broadcast schedule is parked and reset
    pub fn remove(&mut self, query_id: &str) {
        self.active.retain(|e| e.query_id != query_id);

        if self.active.is_empty() {
            self.interval = INITIAL_INTERVAL;
            self.next_at = None;
            self.broadcast_pending = false;
        }
    }

    pub fn contains(&self, query_id: &str) -> bool {
        self.active.iter().any(|e| e.query_id == query_id)
    }

    pub fn get(&self, query_id: &str) -> Option<&ActiveQuery> {
        self.active.iter().find(|e| e.query_id == query_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveQuery> {
        self.active.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.interval = INITIAL_INTERVAL;
        self.next_at = None;
        self.broadcast_pending = false;
    }

    /// Advance the broadcast schedule.
    ///
    /// When a broadcast is due - requested explicitly or because the back-off
    /// deadline passed - the next deadline is armed at the current interval
    /// and the interval doubled (capped at an hour), as per the mDNS
    /// retransmission discipline.
    pub fn poll_broadcast(&mut self, now: Instant) -> BroadcastPoll {
        if self.active.is_empty() {
            return BroadcastPoll::Idle;
        }

        let due = self.broadcast_pending || self.next_at.map(|at| at <= now).unwrap_or(true);

        if due {
            self.broadcast_pending = false;
            self.next_at = Some(now + self.interval);
            self.interval = (self.interval * 2).min(MAX_INTERVAL);

            BroadcastPoll::Broadcast
        } else {
            // Unwrap: `due` is true when `next_at` is unset
            BroadcastPoll::SleepUntil(self.next_at.unwrap())
        }
    }

    /// Flatten all questions and known answers across the active entries
    /// into one broadcast round
    pub fn snapshot(&self) -> BroadcastSnapshot {
        let mut snapshot = BroadcastSnapshot::default();

        for entry in &self.active {
            for query in &entry.queries {
                if snapshot.queries.push(query.clone()).is_err() {
                    debug!("Broadcast question set full, dropping a question");
                }
            }

            for answer in &entry.answers {
                if snapshot.answers.push(answer.clone()).is_err() {
                    debug!("Broadcast known-answer set full, dropping an answer");
                }
            }
        }

        snapshot
    }
}
