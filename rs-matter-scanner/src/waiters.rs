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

//! The registry of pending one-shot awaits, keyed by query identifier.
//!
//! A waiter is a one-shot future cell: the discovering caller registers under
//! its query id and awaits; the correlation layer signals the cell as soon as
//! the discovery criterion is satisfied. A caller-provided timeout resolves
//! the wait normally, so the caller receives whatever is cached at that point.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_futures::select::select;
use embassy_sync::waitqueue::WakerRegistration;
use embassy_time::{Duration, Timer};

use crate::error::{Error, ErrorCode};
use crate::proto::DnsName;

/// The maximum number of concurrently pending discoveries
pub const MAX_WAITERS: usize = 8;

struct Waiter {
    query_id: DnsName,
    has_timeout: bool,
    /// When unset, the waiter belongs to a streaming caller which only wants
    /// to be woken by devices it has not seen yet - cache refreshes of
    /// already-known devices do not signal it
    resolve_on_updated_records: bool,
    woken: bool,
    waker: WakerRegistration,
}

pub struct Waiters {
    waiters: RefCell<heapless::Vec<Waiter, MAX_WAITERS>>,
}

impl Default for Waiters {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiters {
    pub const fn new() -> Self {
        Self {
            waiters: RefCell::new(heapless::Vec::new()),
        }
    }

    /// Register a pending wait under the given query id.
    ///
    /// At most one waiter exists per query id; a second registration replaces
    /// the previous one.
    pub fn register(
        &self,
        query_id: &str,
        has_timeout: bool,
        resolve_on_updated_records: bool,
    ) -> Result<(), Error> {
        let mut waiters = self.waiters.borrow_mut();

        if let Some(waiter) = waiters.iter_mut().find(|w| w.query_id == query_id) {
            waiter.has_timeout = has_timeout;
            waiter.resolve_on_updated_records = resolve_on_updated_records;
            waiter.woken = false;
        } else {
            waiters
                .push(Waiter {
                    query_id: query_id.try_into().map_err(|_| ErrorCode::InvalidArgument)?,
                    has_timeout,
                    resolve_on_updated_records,
                    woken: false,
                    waker: WakerRegistration::new(),
                })
                .map_err(|_| ErrorCode::NoSpace)?;
        }

        Ok(())
    }

    /// Whether a waiter is pending for the given query id
    pub fn exists(&self, query_id: &str) -> bool {
        self.waiters
            .borrow()
            .iter()
            .any(|w| w.query_id == query_id)
    }

    /// Signal the waiter registered under the given query id, if any.
    ///
    /// When `is_updated_record` is set and the waiter opted out of updates
    /// (a streaming caller), the call is a no-op. Otherwise, `resolve` wakes
    /// the caller; an unresolved finish just drops the registration (which
    /// also completes a pending wait - the caller proceeds with whatever is
    /// cached).
    pub fn finish(&self, query_id: &str, resolve: bool, is_updated_record: bool) {
        let mut waiters = self.waiters.borrow_mut();

        let Some(index) = waiters.iter().position(|w| w.query_id == query_id) else {
            return;
        };

        if is_updated_record && !waiters[index].resolve_on_updated_records {
            return;
        }

        if resolve {
            let waiter = &mut waiters[index];
            waiter.woken = true;
            waiter.waker.wake();
        } else {
            let mut waiter = waiters.swap_remove(index);
            waiter.waker.wake();
        }
    }

    /// Await the waiter registered under the given query id.
    ///
    /// Completes when the waiter is finished, or - when a timeout is given -
    /// after the timeout elapses. The registration is removed in all cases.
    pub async fn wait(&self, query_id: &str, timeout: Option<Duration>) {
        let woken = poll_fn(|cx| self.poll_woken(query_id, cx));

        match timeout {
            Some(timeout) => {
                select(woken, Timer::after(timeout)).await;
            }
            None => woken.await,
        }

        self.remove(query_id);
    }

    /// Shutdown: resolve every waiter whose caller set a deadline (such
    /// callers expect eventual completion); waiters without one are left for
    /// their callers to co-cancel
    pub fn close(&self) {
        let mut waiters = self.waiters.borrow_mut();

        for waiter in waiters.iter_mut() {
            if waiter.has_timeout {
                waiter.woken = true;
                waiter.waker.wake();
            }
        }
    }

    fn poll_woken(&self, query_id: &str, cx: &mut Context<'_>) -> Poll<()> {
        let mut waiters = self.waiters.borrow_mut();

        match waiters.iter_mut().find(|w| w.query_id == query_id) {
            Some(waiter) if waiter.woken => Poll::Ready(()),
            Some(waiter) => {
                waiter.waker.register(cx.waker());
                Poll::Pending
            }
            // Registration gone (unresolved finish): complete
            None => Poll::Ready(()),
        }
    }

    fn remove(&self, query_id: &str) {
        self.waiters
            .borrow_mut()
            .retain(|w| w.query_id != query_id);
    }
}
