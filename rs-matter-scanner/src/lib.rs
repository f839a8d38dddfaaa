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

//! mDNS / DNS-SD discovery of Matter nodes.
//!
//! This crate implements the controller-side mDNS scanner of a Matter stack:
//! an asynchronous discovery engine which locates operational (already
//! commissioned) and commissionable Matter nodes on the local network, as per
//! RFC 6762 (mDNS) and RFC 6763 (DNS-SD).
//!
//! The scanner synthesizes and retransmits queries on an exponential back-off
//! schedule, assembles partial PTR/SRV/TXT/A/AAAA records arriving in arbitrary
//! order into coherent device descriptors, maintains a TTL-indexed cache and
//! fulfils awaiting callers as soon as their discovery criterion is satisfied.
//!
//! `no_std` and no-alloc, in the tradition of `rs-matter`: all state lives in
//! `heapless` collections with fixed capacities, and the engine runs
//! cooperatively on a single executor, driven by `MdnsScanner::run`.

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)]

pub mod cache;
pub mod device;
pub mod error;
pub mod filter;
pub mod network;
pub mod proto;
pub mod queries;
pub mod scanner;
pub mod txt;
pub mod utils;
pub mod waiters;

/// The DNS-SD service type under which operational (commissioned) Matter
/// nodes advertise themselves.
pub const MATTER_SERVICE_NAME: &str = "_matter._tcp.local";

/// The DNS-SD service type under which commissionable Matter nodes advertise
/// themselves.
pub const MATTER_COMMISSION_SERVICE_NAME: &str = "_matterc._udp.local";

/// The maximum size of an mDNS message we are willing to put on the wire.
/// Larger known-answer sets are split across multiple truncated messages.
pub const MAX_MDNS_MESSAGE_SIZE: usize = 1500;

/// The maximum length of a DNS name the scanner can track.
///
/// Long enough for the operational service instance names
/// (`<fabric-hex>-<node-hex>._matter._tcp.local` is 53 characters) as well as
/// for the typical hostnames SRV records point to.
pub const MAX_DNS_NAME_LEN: usize = 64;
