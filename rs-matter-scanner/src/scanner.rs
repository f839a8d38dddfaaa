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

//! The scanner itself: the public discovery API, the correlation of received
//! records into the device cache and the driver loops for broadcasting,
//! receiving and cache expiry.

use core::cell::{Cell, RefCell};
use core::fmt::Write as _;
use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use core::pin::pin;

use embassy_futures::select::{select, select4, Either, Either4};
use embassy_sync::blocking_mutex::raw::{NoopRawMutex, RawMutex};
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use log::{debug, info, warn};

use crate::cache::{DeviceCache, MAX_COMMISSIONABLE_DEVICES};
use crate::device::{
    sort_addresses, CommissionableDevice, InstanceName, OperationalDevice,
};
use crate::error::{Error, ErrorCode};
use crate::filter::{active_query_candidates, CommissionableFilter};
use crate::network::{
    NetworkReceive, NetworkSend, MAX_RX_PACKET_SIZE, MDNS_IPV4_BROADCAST_ADDR,
    MDNS_IPV6_BROADCAST_ADDR, MDNS_PORT,
};
use crate::proto::{
    self, name_in_service, DnsName, DnsQuery, DnsQueryType, DnsRecord, DnsRecordData, TxtItems,
};
use crate::queries::{BroadcastPoll, BroadcastSnapshot, QuerySet, MAX_BROADCAST_ANSWERS};
use crate::txt::TxtData;
use crate::waiters::Waiters;
use crate::{MATTER_COMMISSION_SERVICE_NAME, MATTER_SERVICE_NAME, MAX_MDNS_MESSAGE_SIZE};

/// The interval of the periodic cache expiry sweep
const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

/// Scanner configuration
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ScannerConfig {
    /// Whether to consume A records and send on the IPv4 broadcast address.
    /// Matter is IPv6-first; IPv4 is an opt-in
    pub enable_ipv4: bool,
}

impl ScannerConfig {
    pub const fn new() -> Self {
        Self { enable_ipv4: true }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The full service instance name under which an operational node of the
/// given fabric advertises itself
pub fn operational_instance_name(compressed_fabric_id: u64, node_id: u64) -> DnsName {
    let mut name = DnsName::new();

    // Fits: 16 + 1 + 16 + 1 + len("_matter._tcp.local")
    write!(
        name,
        "{:016X}-{:016X}.{}",
        compressed_fabric_id, node_id, MATTER_SERVICE_NAME
    )
    .unwrap();

    name
}

/// An mDNS scanner for discovering Matter devices on the local network.
///
/// The scanner is split into a passive object carrying all state and an
/// active `run` future driving the network and the timers; the discovery
/// methods can be called concurrently with `run` from other tasks of the
/// same executor:
///
/// - [`MdnsScanner::find_operational_device`] locates a commissioned node by
///   its fabric and node id
/// - [`MdnsScanner::find_commissionable_devices`] collects nodes available
///   for commissioning which satisfy a [`CommissionableFilter`]
/// - [`MdnsScanner::find_commissionable_devices_continuously`] streams newly
///   discovered commissionable nodes to a callback
///
/// All discovery is answered from the TTL-bounded record cache when possible;
/// otherwise queries are put on the wire and re-transmitted with exponential
/// back-off until the discovery criterion is satisfied or the caller's
/// timeout elapses.
pub struct MdnsScanner {
    config: ScannerConfig,
    cache: RefCell<DeviceCache>,
    queries: RefCell<QuerySet>,
    waiters: Waiters,
    /// Wakes the broadcast loop when the active query set changes
    changed: Signal<NoopRawMutex, ()>,
    closed: Cell<bool>,
    close_signal: Signal<NoopRawMutex, ()>,
}

impl MdnsScanner {
    pub const fn new(config: ScannerConfig) -> Self {
        Self {
            config,
            cache: RefCell::new(DeviceCache::new()),
            queries: RefCell::new(QuerySet::new()),
            waiters: Waiters::new(),
            changed: Signal::new(),
            closed: Cell::new(false),
            close_signal: Signal::new(),
        }
    }

    /// Run the scanner: broadcast scheduled queries, ingest responses and
    /// sweep the cache, until [`MdnsScanner::close`] is called.
    ///
    /// # Arguments
    /// * `send` - An object implementing the `NetworkSend` trait for sending mDNS packets.
    /// * `recv` - An object implementing the `NetworkReceive` trait for receiving mDNS packets.
    /// * `ipv4_interface` - An optional IPv4 address of the interface to use for mDNS broadcasts.
    /// * `ipv6_interface` - An optional IPv6 interface index to use for mDNS broadcasts.
    pub async fn run<S, R>(
        &self,
        send: S,
        recv: R,
        ipv4_interface: Option<Ipv4Addr>,
        ipv6_interface: Option<u32>,
    ) -> Result<(), Error>
    where
        S: NetworkSend,
        R: NetworkReceive,
    {
        info!("Running mDNS scanner");

        let send = Mutex::<NoopRawMutex, _>::new(send);

        let mut broadcast = pin!(self.broadcast_loop(&send, ipv4_interface, ipv6_interface));
        let mut receive = pin!(self.receive_loop(recv));
        let mut expire = pin!(self.expire_loop());
        let mut closed = pin!(self.close_signal.wait());

        match select4(&mut broadcast, &mut receive, &mut expire, &mut closed).await {
            Either4::First(result) => result,
            Either4::Second(result) => result,
            Either4::Third(result) => result,
            Either4::Fourth(_) => {
                info!("mDNS scanner closed");
                Ok(())
            }
        }
    }

    /// Mark the scanner closed: all schedules are dropped and every pending
    /// discovery which has a deadline is resolved with whatever is cached.
    /// Discoveries without a deadline are left for their callers to cancel.
    ///
    /// `run` returns shortly after; discovery calls made from now on fail
    /// with `ErrorCode::InvalidState`.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }

        info!("Closing mDNS scanner");

        self.queries.borrow_mut().clear();
        self.waiters.close();
        self.changed.signal(());
        self.close_signal.signal(());
    }

    /// Locate an operational (already commissioned) device by the compressed
    /// id of its fabric and its node id.
    ///
    /// A cache hit returns immediately; otherwise an SRV query for the
    /// operational service instance name goes on the wire and the call waits
    /// until the device is discovered with at least one address, or - when a
    /// timeout is given - the timeout elapses. Absence is `None`, never an
    /// error.
    ///
    /// The addresses of the returned device are sorted by reachability
    /// preference (IPv6 unique-local, link-local, other IPv6, IPv4).
    pub async fn find_operational_device(
        &self,
        compressed_fabric_id: u64,
        node_id: u64,
        timeout: Option<Duration>,
        ignore_cache: bool,
    ) -> Result<Option<OperationalDevice>, Error> {
        self.check_open()?;

        let name = operational_instance_name(compressed_fabric_id, node_id);

        if !ignore_cache {
            if let Some(device) = self.lookup_operational(&name) {
                return Ok(Some(device));
            }
        }

        debug!("Operational device {} not cached, querying", name);

        self.waiters.register(&name, timeout.is_some(), true)?;
        self.install_query(&name, &[DnsQuery::new(&name, DnsQueryType::Srv)?], &[]);

        self.waiters.wait(&name, timeout).await;

        self.remove_query(&name);

        Ok(self.lookup_operational(&name))
    }

    /// Finish a pending operational discovery for the given fabric/node pair.
    /// With `resolve` unset, the discovery is abandoned instead of resolved.
    pub fn cancel_operational_device_discovery(
        &self,
        compressed_fabric_id: u64,
        node_id: u64,
        resolve: bool,
    ) {
        let name = operational_instance_name(compressed_fabric_id, node_id);

        self.waiters.finish(&name, resolve, false);
        self.remove_query(&name);
    }

    /// Collect the commissionable devices satisfying the filter.
    ///
    /// When the cache already holds at least one matching device with an
    /// address, those are returned immediately with no network traffic.
    /// Otherwise the commission service (and, where the filter defines one,
    /// its sub-service) is browsed until the timeout elapses, and whatever
    /// was discovered is returned. Addresses are sorted as in
    /// [`MdnsScanner::find_operational_device`].
    pub async fn find_commissionable_devices(
        &self,
        filter: &CommissionableFilter,
        timeout: Duration,
        ignore_cache: bool,
    ) -> Result<heapless::Vec<CommissionableDevice, MAX_COMMISSIONABLE_DEVICES>, Error> {
        self.check_open()?;

        if !ignore_cache {
            let devices = self.lookup_commissionable(filter);
            if !devices.is_empty() {
                return Ok(devices);
            }
        }

        let query_id = filter.query_id();

        debug!("No commissionable devices cached for {}, browsing", query_id);

        self.waiters.register(&query_id, true, true)?;
        self.install_commission_queries(&query_id, filter)?;

        self.waiters.wait(&query_id, Some(timeout)).await;

        self.remove_query(&query_id);

        Ok(self.lookup_commissionable(filter))
    }

    /// Browse for commissionable devices satisfying the filter for the whole
    /// `timeout`, reporting each newly discovered device to `f` exactly once
    /// (keyed by instance id). Refreshes of already-reported devices are not
    /// reported again.
    ///
    /// The browse ends when the timeout elapses, the `cancel` signal fires or
    /// the scanner is closed.
    pub async fn find_commissionable_devices_continuously<F>(
        &self,
        filter: &CommissionableFilter,
        timeout: Duration,
        cancel: Option<&Signal<NoopRawMutex, ()>>,
        mut f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&CommissionableDevice),
    {
        self.check_open()?;

        let query_id = filter.query_id();

        // The single deadline for the whole browse; every wait below is
        // bounded by the time remaining to it
        let deadline = Instant::now() + timeout;

        let mut seen = heapless::Vec::<InstanceName, 16>::new();
        let mut canceled = false;

        self.install_commission_queries(&query_id, filter)?;

        loop {
            for device in self.lookup_commissionable(filter) {
                if seen.iter().any(|id| *id == device.instance_id) {
                    continue;
                }

                if seen.push(device.instance_id.clone()).is_err() {
                    debug!("Seen-device set full, device will be re-reported");
                }

                f(&device);
            }

            let now = Instant::now();
            if canceled || self.closed.get() || now >= deadline {
                break;
            }

            // Only newly discovered devices wake this waiter; cache
            // refreshes of devices reported above do not
            self.waiters.register(&query_id, true, false)?;

            match cancel {
                Some(cancel) => {
                    let wait = self.waiters.wait(&query_id, Some(deadline - now));

                    if let Either::Second(()) = select(wait, cancel.wait()).await {
                        canceled = true;
                    }
                }
                None => self.waiters.wait(&query_id, Some(deadline - now)).await,
            }
        }

        // Drop a leftover registration from a canceled wait, if any
        self.waiters.finish(&query_id, false, false);
        self.remove_query(&query_id);

        Ok(())
    }

    /// A pure cache read of an operational device; no network traffic
    pub fn get_discovered_operational_device(
        &self,
        compressed_fabric_id: u64,
        node_id: u64,
    ) -> Option<OperationalDevice> {
        self.lookup_operational(&operational_instance_name(compressed_fabric_id, node_id))
    }

    /// A pure cache read of the commissionable devices satisfying the filter
    pub fn get_discovered_commissionable_devices(
        &self,
        filter: &CommissionableFilter,
    ) -> heapless::Vec<CommissionableDevice, MAX_COMMISSIONABLE_DEVICES> {
        self.lookup_commissionable(filter)
    }

    /// Ingest a single received datagram.
    ///
    /// Public for transports which dispatch datagrams themselves; `run`
    /// drives this from its receive loop.
    pub fn handle_response(&self, data: &[u8], remote: SocketAddr, interface: &str) {
        if self.closed.get() {
            return;
        }

        let mut records = heapless::Vec::new();

        match proto::parse_response(data, &mut records) {
            Ok(true) => (),
            Ok(false) => return,
            Err(_) => {
                debug!("Ignoring unparseable mDNS packet from {}", remote);
                return;
            }
        }

        if records.is_empty() {
            return;
        }

        debug!(
            "Processing mDNS response from {} with {} records",
            remote,
            records.len()
        );

        // The known answers accumulated across the active queries give the
        // context of earlier packets of a multi-packet truncated response
        let former = self.former_answers();

        // A single packet never mixes operational and commissionable
        // services at this layer
        if !self.handle_operational(&records, &former, interface) {
            self.handle_commissionable(&records, &former, interface);
        }
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.get() {
            Err(ErrorCode::InvalidState.into())
        } else {
            Ok(())
        }
    }

    fn lookup_operational(&self, name: &str) -> Option<OperationalDevice> {
        let cache = self.cache.borrow();

        let device = cache.operational(name)?;
        if device.addresses.is_empty() {
            return None;
        }

        let mut device = device.clone();
        sort_addresses(&mut device.addresses);

        Some(device)
    }

    fn lookup_commissionable(
        &self,
        filter: &CommissionableFilter,
    ) -> heapless::Vec<CommissionableDevice, MAX_COMMISSIONABLE_DEVICES> {
        let cache = self.cache.borrow();
        let mut devices = heapless::Vec::new();

        for device in cache.query(filter) {
            if device.addresses.is_empty() {
                continue;
            }

            let mut device = device.clone();
            sort_addresses(&mut device.addresses);

            if devices.push(device).is_err() {
                break;
            }
        }

        devices
    }

    /// Register query records under a query id, waking the broadcast loop
    /// when the schedule was touched
    fn install_query(&self, query_id: &str, queries: &[DnsQuery], known_answers: &[DnsRecord]) {
        match self
            .queries
            .borrow_mut()
            .set_query_records(query_id, queries, known_answers)
        {
            Ok(true) => self.changed.signal(()),
            Ok(false) => (),
            Err(e) => debug!("Failed to install query {}: {}", query_id, e),
        }
    }

    fn install_commission_queries(
        &self,
        query_id: &str,
        filter: &CommissionableFilter,
    ) -> Result<(), Error> {
        let mut queries = heapless::Vec::<DnsQuery, 2>::new();

        // The commission service browse is always on; the predicate-specific
        // sub-service browse narrows the responder set where one exists
        let _ = queries.push(DnsQuery::new(
            MATTER_COMMISSION_SERVICE_NAME,
            DnsQueryType::Ptr,
        )?);

        if let Some(service) = filter.service_name() {
            let _ = queries.push(DnsQuery::new(&service, DnsQueryType::Ptr)?);
        }

        self.install_query(query_id, &queries, &[]);

        Ok(())
    }

    fn remove_query(&self, query_id: &str) {
        self.queries.borrow_mut().remove(query_id);
        self.changed.signal(());
    }

    fn former_answers(&self) -> heapless::Vec<DnsRecord, MAX_BROADCAST_ANSWERS> {
        let mut answers = heapless::Vec::new();

        for entry in self.queries.borrow().iter() {
            for answer in &entry.answers {
                if answers.push(answer.clone()).is_err() {
                    debug!("Former-answer context full, dropping an answer");
                }
            }
        }

        answers
    }

    /// The operational path of the correlator.
    ///
    /// Returns whether the packet was consumed as operational.
    fn handle_operational(
        &self,
        records: &[DnsRecord],
        former: &[DnsRecord],
        interface: &str,
    ) -> bool {
        let now = Instant::now();
        let mut handled = false;

        // TXT answers update the cache entry for their exact name
        for record in records {
            let DnsRecordData::Txt(payload) = &record.data else {
                continue;
            };

            if !name_in_service(&record.name, MATTER_SERVICE_NAME) {
                continue;
            }

            handled = true;

            let data = TxtData::parse(TxtItems::new(payload));

            let existed = {
                let mut cache = self.cache.borrow_mut();
                let existed = cache.operational(&record.name).is_some();

                if let Err(e) =
                    cache.upsert_operational_txt(&record.name, record.ttl_sec, data, now)
                {
                    debug!("Dropping operational TXT for {}: {}", record.name, e);
                }

                existed
            };

            // A refresh of a device whose addresses are already known
            // satisfies a pending discovery right away; an address-less
            // update waits for the SRV/address chain below
            let has_addresses = self
                .cache
                .borrow()
                .operational(&record.name)
                .map(|device| !device.addresses.is_empty())
                .unwrap_or(false);

            if has_addresses {
                self.waiters.finish(&record.name, true, existed);
            }
        }

        // SRV answers, preferring the fresh packet and falling back to the
        // former-answer context (a truncated response delivers the SRV and
        // the addresses in separate packets)
        let mut srv_records = heapless::Vec::<&DnsRecord, 8>::new();

        for source in [records, former] {
            for record in source {
                if matches!(record.data, DnsRecordData::Srv { .. })
                    && name_in_service(&record.name, MATTER_SERVICE_NAME)
                    && srv_records.push(record).is_err()
                {
                    debug!("Too many operational SRV records, dropping one");
                }
            }

            if !srv_records.is_empty() {
                break;
            }
        }

        for srv in srv_records {
            handled = true;
            self.handle_operational_srv(srv, records, former, interface, now);
        }

        handled
    }

    fn handle_operational_srv(
        &self,
        srv: &DnsRecord,
        records: &[DnsRecord],
        former: &[DnsRecord],
        interface: &str,
        now: Instant,
    ) {
        let DnsRecordData::Srv { port, target, .. } = &srv.data else {
            return;
        };

        let outcome = match self.cache.borrow_mut().upsert_operational_srv(
            &srv.name,
            srv.ttl_sec,
            target,
            *port,
            records,
            former,
            interface,
            self.config.enable_ipv4,
            now,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Dropping operational SRV for {}: {}", srv.name, e);
                return;
            }
        };

        // A goodbye needs no follow-up
        let Some(outcome) = outcome else {
            return;
        };

        if outcome.has_addresses {
            debug!("Operational device {} has addresses, waking waiter", srv.name);
            self.waiters.finish(&srv.name, true, outcome.existed);
        } else if self.waiters.exists(&srv.name) {
            // No address records made it into this packet (or survived);
            // chase the SRV target before waking anyone
            debug!("Querying addresses of {} for {}", target, srv.name);
            self.install_address_query(&srv.name, target, records);
        }
    }

    /// The commissionable path of the correlator
    fn handle_commissionable(&self, records: &[DnsRecord], former: &[DnsRecord], interface: &str) {
        let now = Instant::now();

        // Instances born in this packet without any addresses yet; unless an
        // SRV below fills them in, they are chased with an ANY query
        let mut missing = heapless::Vec::<InstanceName, 8>::new();

        // TXT records first: they decide whether an entry exists at all
        for record in records {
            let DnsRecordData::Txt(payload) = &record.data else {
                continue;
            };

            if !name_in_service(&record.name, MATTER_COMMISSION_SERVICE_NAME) {
                continue;
            }

            let Some(instance_id) = instance_id(&record.name) else {
                continue;
            };

            if record.ttl_sec == 0 {
                debug!("Goodbye for commissionable device {}", instance_id);
                self.cache.borrow_mut().remove_commissionable(&instance_id);
                continue;
            }

            // A commissionable advertisement without D and CM is unusable
            // and is discarded; a previously cached valid record stays
            let Some(data) = TxtData::parse_commissionable(TxtItems::new(payload)) else {
                debug!("Discarding incomplete commissionable TXT for {}", record.name);
                continue;
            };

            match self.cache.borrow_mut().upsert_commissionable_txt(
                &instance_id,
                record.ttl_sec,
                data,
                now,
            ) {
                Ok(true) => {
                    // Newly created, so no addresses yet
                    if !missing.contains(&instance_id) {
                        let _ = missing.push(instance_id);
                    }
                }
                Ok(false) => (),
                Err(e) => debug!("Dropping commissionable TXT for {}: {}", record.name, e),
            }
        }

        // SRV records second: they carry the port and lead to the addresses
        for record in records {
            let DnsRecordData::Srv { port, target, .. } = &record.data else {
                continue;
            };

            if !name_in_service(&record.name, MATTER_COMMISSION_SERVICE_NAME) {
                continue;
            }

            let Some(instance_id) = instance_id(&record.name) else {
                continue;
            };

            let Some(outcome) = self.cache.borrow_mut().upsert_commissionable_srv(
                &instance_id,
                record.ttl_sec,
                target,
                *port,
                records,
                former,
                interface,
                self.config.enable_ipv4,
                now,
            ) else {
                // Either a goodbye or an instance we have no (valid) TXT for
                missing.retain(|id| *id != instance_id);
                continue;
            };

            let Some(device) = self.cache.borrow().commissionable(&instance_id).cloned() else {
                continue;
            };

            if outcome.has_addresses {
                missing.retain(|id| *id != instance_id);

                if let Some(query_id) = self.find_active_query_id(&device) {
                    debug!(
                        "Commissionable device {} has addresses, waking waiter {}",
                        instance_id, query_id
                    );
                    self.waiters.finish(&query_id, true, outcome.had_addresses);
                }
            } else if let Some(query_id) = self.find_active_query_id(&device) {
                debug!("Querying addresses of {} for {}", target, instance_id);
                self.install_address_query(&query_id, target, records);
            }
        }

        // Whatever is still missing its SRV/addresses is chased with an
        // ANY query for the full instance name
        for instance_id in &missing {
            let Some(device) = self
                .cache
                .borrow()
                .commissionable(instance_id)
                .cloned()
            else {
                continue;
            };

            let Some(query_id) = self.find_active_query_id(&device) else {
                continue;
            };

            let mut name = DnsName::new();
            if write!(name, "{}.{}", instance_id, MATTER_COMMISSION_SERVICE_NAME).is_err() {
                continue;
            }

            match DnsQuery::new(&name, DnsQueryType::Any) {
                Ok(query) => {
                    debug!("Querying missing data of {} for {}", name, query_id);
                    self.install_query(&query_id, &[query], records);
                }
                Err(e) => debug!("Cannot query missing data of {}: {}", name, e),
            }
        }
    }

    /// Install a follow-up AAAA (and, with IPv4 enabled, A) query for an SRV
    /// target under an existing query id, submitting the current packet's
    /// answers for known-answer suppression
    fn install_address_query(&self, query_id: &str, target: &str, known_answers: &[DnsRecord]) {
        let mut queries = heapless::Vec::<DnsQuery, 2>::new();

        let aaaa = match DnsQuery::new(target, DnsQueryType::Aaaa) {
            Ok(query) => query,
            Err(e) => {
                debug!("Cannot query addresses of {}: {}", target, e);
                return;
            }
        };

        let _ = queries.push(aaaa);

        if self.config.enable_ipv4 {
            if let Ok(a) = DnsQuery::new(target, DnsQueryType::A) {
                let _ = queries.push(a);
            }
        }

        self.install_query(query_id, &queries, known_answers);
    }

    /// The active query id a commissionable record belongs to: the first
    /// identifier derived from the record for which a query is active -
    /// instance id, long discriminator, short discriminator, vendor+product,
    /// vendor, device type, product, and finally the "any commissioning
    /// device" key
    fn find_active_query_id(&self, device: &CommissionableDevice) -> Option<DnsName> {
        let queries = self.queries.borrow();

        active_query_candidates(device)
            .into_iter()
            .map(|filter| filter.query_id())
            .find(|id| queries.contains(id))
    }

    async fn broadcast_loop<S>(
        &self,
        send: &Mutex<impl RawMutex, S>,
        ipv4_interface: Option<Ipv4Addr>,
        ipv6_interface: Option<u32>,
    ) -> Result<(), Error>
    where
        S: NetworkSend,
    {
        loop {
            let poll = self.queries.borrow_mut().poll_broadcast(Instant::now());

            match poll {
                BroadcastPoll::Broadcast => {
                    let snapshot = self.queries.borrow().snapshot();

                    self.broadcast(send, &snapshot, ipv4_interface, ipv6_interface)
                        .await;
                }
                BroadcastPoll::SleepUntil(at) => {
                    select(self.changed.wait(), Timer::at(at)).await;
                }
                BroadcastPoll::Idle => self.changed.wait().await,
            }
        }
    }

    /// Put one broadcast round on the wire, splitting the known answers
    /// across as many truncated messages as they need.
    ///
    /// Send failures are logged and swallowed: the back-off schedule retries
    /// the broadcast at the next interval anyway.
    async fn broadcast<S>(
        &self,
        send: &Mutex<impl RawMutex, S>,
        snapshot: &BroadcastSnapshot,
        ipv4_interface: Option<Ipv4Addr>,
        ipv6_interface: Option<u32>,
    ) where
        S: NetworkSend,
    {
        let mut buf = [0; MAX_MDNS_MESSAGE_SIZE];
        let mut start = 0;

        loop {
            let (len, consumed, truncated) =
                match proto::build_query(&snapshot.queries, &snapshot.answers[start..], &mut buf) {
                    Ok(built) => built,
                    Err(e) => {
                        warn!("Failed to marshal mDNS query: {}", e);
                        return;
                    }
                };

            start += consumed;

            for addr in Iterator::chain(
                ipv4_interface
                    .filter(|_| self.config.enable_ipv4)
                    .map(|_| SocketAddr::V4(SocketAddrV4::new(MDNS_IPV4_BROADCAST_ADDR, MDNS_PORT)))
                    .into_iter(),
                ipv6_interface
                    .map(|interface| {
                        SocketAddr::V6(SocketAddrV6::new(
                            MDNS_IPV6_BROADCAST_ADDR,
                            MDNS_PORT,
                            0,
                            interface,
                        ))
                    })
                    .into_iter(),
            ) {
                let mut send = send.lock().await;

                if let Err(e) = send.send_to(&buf[..len], addr).await {
                    warn!("Failed to send mDNS query to {}: {}", addr, e);
                } else {
                    debug!(
                        "Sent mDNS query to {}: {} bytes, {} questions{}",
                        addr,
                        len,
                        snapshot.queries.len(),
                        if truncated { ", truncated" } else { "" }
                    );
                }
            }

            if !truncated {
                break;
            }
        }
    }

    async fn receive_loop<R>(&self, mut recv: R) -> Result<(), Error>
    where
        R: NetworkReceive,
    {
        let mut buf = [0; MAX_RX_PACKET_SIZE];

        loop {
            recv.wait_available().await?;

            let (len, addr, interface) = recv.recv_from(&mut buf).await?;

            self.handle_response(&buf[..len], addr, &interface);
        }
    }

    async fn expire_loop(&self) -> Result<(), Error> {
        loop {
            Timer::after(EXPIRY_INTERVAL).await;

            self.cache.borrow_mut().expire(Instant::now());
        }
    }
}

fn instance_id(name: &str) -> Option<InstanceName> {
    let label = name.split('.').next()?;

    match label.try_into() {
        Ok(id) => Some(id),
        Err(_) => {
            debug!("Instance name {} too long, record skipped", label);
            None
        }
    }
}
