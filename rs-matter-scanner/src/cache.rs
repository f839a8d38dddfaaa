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

//! The record cache: two disjoint keyed stores of operational and
//! commissionable devices with per-device and per-address TTL expiry.

use core::net::IpAddr;

use embassy_time::{Duration, Instant};

use log::debug;

use crate::device::{
    expire_addresses, remove_address, upsert_address, CommissionableDevice, DeviceAddress,
    InstanceName, OperationalDevice, MAX_DEVICE_ADDRESSES,
};
use crate::error::{Error, ErrorCode};
use crate::filter::CommissionableFilter;
use crate::proto::{names_match, DnsRecord, DnsRecordData};
use crate::txt::TxtData;

/// The maximum number of operational devices the cache tracks
pub const MAX_OPERATIONAL_DEVICES: usize = 8;

/// The maximum number of commissionable devices the cache tracks
pub const MAX_COMMISSIONABLE_DEVICES: usize = 8;

/// The outcome of an SRV-path upsert: what the correlation layer needs to
/// decide between waking a waiter and chasing the target's addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrvUpsert {
    /// Whether the device was cached before the update
    pub existed: bool,
    /// Whether the device had at least one address before the update
    pub had_addresses: bool,
    /// Whether the device has at least one address after the update
    pub has_addresses: bool,
}

/// The keyed store of all devices the scanner has assembled out of received
/// records and not yet expired.
///
/// Devices are born on a matching TXT (commissionable) or TXT/SRV
/// (operational) response, refreshed by any matching record with a non-zero
/// TTL, trimmed per-address when an address TTL lapses or a zero-TTL goodbye
/// arrives, and destroyed by the periodic expiry sweep or a goodbye for the
/// owning record.
pub struct DeviceCache {
    operational: heapless::Vec<OperationalDevice, MAX_OPERATIONAL_DEVICES>,
    commissionable: heapless::Vec<CommissionableDevice, MAX_COMMISSIONABLE_DEVICES>,
}

impl Default for DeviceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCache {
    pub const fn new() -> Self {
        Self {
            operational: heapless::Vec::new(),
            commissionable: heapless::Vec::new(),
        }
    }

    pub fn operational(&self, name: &str) -> Option<&OperationalDevice> {
        self.operational
            .iter()
            .find(|device| names_match(&device.name, name))
    }

    pub fn operational_mut(&mut self, name: &str) -> Option<&mut OperationalDevice> {
        self.operational
            .iter_mut()
            .find(|device| names_match(&device.name, name))
    }

    /// Merge a TXT decode into the operational entry with the given name,
    /// creating an empty-addresses entry when none exists yet.
    /// A zero TTL removes the entry instead.
    pub fn upsert_operational_txt(
        &mut self,
        name: &str,
        ttl_sec: u32,
        data: TxtData,
        now: Instant,
    ) -> Result<(), Error> {
        if ttl_sec == 0 {
            self.remove_operational(name);
            return Ok(());
        }

        let device = self.ensure_operational(name, ttl_sec, now)?;

        device.data = data;
        device.discovered_at = now;
        device.ttl = Duration::from_secs(ttl_sec as _);

        Ok(())
    }

    /// Fetch the operational entry with the given name, creating an
    /// empty-addresses entry when none exists (the SRV path: addresses are
    /// refreshed by the caller out of the A/AAAA records it correlates)
    pub fn ensure_operational(
        &mut self,
        name: &str,
        ttl_sec: u32,
        now: Instant,
    ) -> Result<&mut OperationalDevice, Error> {
        if self.operational(name).is_none() {
            let device = OperationalDevice::new(
                name.try_into().map_err(|_| ErrorCode::InvalidArgument)?,
                now,
                Duration::from_secs(ttl_sec as _),
            );

            self.operational
                .push(device)
                .map_err(|_| ErrorCode::NoSpace)?;
        }

        // Unwrap: just found or inserted
        Ok(self.operational_mut(name).unwrap())
    }

    /// Apply an SRV answer to the operational entry with the given name:
    /// ensure the entry exists, then add or refresh every address of the SRV
    /// target found among the packet's records (or the known-answer context
    /// of the active queries). A zero TTL removes the entry instead;
    /// `Ok(None)` is returned for it.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_operational_srv(
        &mut self,
        name: &str,
        ttl_sec: u32,
        target: &str,
        port: u16,
        records: &[DnsRecord],
        former: &[DnsRecord],
        interface: &str,
        enable_ipv4: bool,
        now: Instant,
    ) -> Result<Option<SrvUpsert>, Error> {
        if ttl_sec == 0 {
            debug!("Goodbye for operational device {}", name);
            self.remove_operational(name);
            return Ok(None);
        }

        let existed = self.operational(name).is_some();

        let device = self.ensure_operational(name, ttl_sec, now)?;

        let had_addresses = !device.addresses.is_empty();

        refresh_addresses(
            &mut device.addresses,
            target,
            port,
            records,
            former,
            interface,
            enable_ipv4,
            now,
        );

        Ok(Some(SrvUpsert {
            existed,
            had_addresses,
            has_addresses: !device.addresses.is_empty(),
        }))
    }

    pub fn remove_operational(&mut self, name: &str) {
        self.operational.retain(|device| !names_match(&device.name, name));
    }

    pub fn commissionable(&self, instance_id: &str) -> Option<&CommissionableDevice> {
        self.commissionable
            .iter()
            .find(|device| device.instance_id.eq_ignore_ascii_case(instance_id))
    }

    pub fn commissionable_mut(&mut self, instance_id: &str) -> Option<&mut CommissionableDevice> {
        self.commissionable
            .iter_mut()
            .find(|device| device.instance_id.eq_ignore_ascii_case(instance_id))
    }

    /// Merge a freshly parsed commissionable TXT decode into the entry with
    /// the given instance id, preserving any pre-existing addresses.
    ///
    /// Returns whether a new entry was created (such an entry has no
    /// addresses yet, so the correlation layer follows up with an address
    /// query for it).
    pub fn upsert_commissionable_txt(
        &mut self,
        instance_id: &InstanceName,
        ttl_sec: u32,
        data: TxtData,
        now: Instant,
    ) -> Result<bool, Error> {
        if ttl_sec == 0 {
            self.remove_commissionable(instance_id);
            return Ok(false);
        }

        let ttl = Duration::from_secs(ttl_sec as _);

        if let Some(device) = self.commissionable_mut(instance_id) {
            device.update_data(data, now, ttl);

            Ok(false)
        } else {
            self.commissionable
                .push(CommissionableDevice::new(instance_id.clone(), data, now, ttl))
                .map_err(|_| ErrorCode::NoSpace)?;

            Ok(true)
        }
    }

    /// Apply an SRV answer to the commissionable entry with the given
    /// instance id, mirroring the operational path. An SRV for an instance
    /// without a (valid) cached TXT is not actionable - the entry is keyed by
    /// the TXT identifiers - and yields `None`, as does a zero TTL, which
    /// removes the entry.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_commissionable_srv(
        &mut self,
        instance_id: &str,
        ttl_sec: u32,
        target: &str,
        port: u16,
        records: &[DnsRecord],
        former: &[DnsRecord],
        interface: &str,
        enable_ipv4: bool,
        now: Instant,
    ) -> Option<SrvUpsert> {
        if ttl_sec == 0 {
            debug!("Goodbye for commissionable device {}", instance_id);
            self.remove_commissionable(instance_id);
            return None;
        }

        let device = self.commissionable_mut(instance_id)?;

        let had_addresses = !device.addresses.is_empty();

        refresh_addresses(
            &mut device.addresses,
            target,
            port,
            records,
            former,
            interface,
            enable_ipv4,
            now,
        );

        Some(SrvUpsert {
            existed: true,
            had_addresses,
            has_addresses: !device.addresses.is_empty(),
        })
    }

    pub fn remove_commissionable(&mut self, instance_id: &str) {
        self.commissionable
            .retain(|device| !device.instance_id.eq_ignore_ascii_case(instance_id));
    }

    /// All cached commissionable devices satisfying the filter
    pub fn query<'a>(
        &'a self,
        filter: &'a CommissionableFilter,
    ) -> impl Iterator<Item = &'a CommissionableDevice> + 'a {
        self.commissionable
            .iter()
            .filter(|device| filter.matches(device))
    }

    /// The periodic expiry sweep: trim lapsed addresses, then drop every
    /// device whose own TTL has lapsed or which is left without addresses
    pub fn expire(&mut self, now: Instant) {
        self.operational.retain_mut(|device| {
            expire_addresses(&mut device.addresses, now);

            let keep = !device.expired(now) && !device.addresses.is_empty();
            if !keep {
                debug!("Expiring operational device {}", device.name);
            }

            keep
        });

        self.commissionable.retain_mut(|device| {
            expire_addresses(&mut device.addresses, now);

            let keep = !device.expired(now) && !device.addresses.is_empty();
            if !keep {
                debug!("Expiring commissionable device {}", device.instance_id);
            }

            keep
        });
    }

    /// Drop everything (scanner shutdown)
    pub fn clear(&mut self) {
        self.operational.clear();
        self.commissionable.clear();
    }
}

/// Add or refresh the addresses of an SRV target out of the A/AAAA records of
/// the packet and the known-answer context, dropping A records unless IPv4 is
/// enabled. A zero-TTL address record is a goodbye for that single address.
#[allow(clippy::too_many_arguments)]
fn refresh_addresses(
    addresses: &mut heapless::Vec<DeviceAddress, MAX_DEVICE_ADDRESSES>,
    target: &str,
    port: u16,
    records: &[DnsRecord],
    former: &[DnsRecord],
    interface: &str,
    enable_ipv4: bool,
    now: Instant,
) {
    for record in records.iter().chain(former) {
        if !names_match(&record.name, target) {
            continue;
        }

        let ip = match record.data {
            DnsRecordData::A(ip) if enable_ipv4 => IpAddr::V4(ip),
            DnsRecordData::Aaaa(ip) => IpAddr::V6(ip),
            _ => continue,
        };

        let address = match DeviceAddress::new(
            ip,
            port,
            interface,
            now,
            Duration::from_secs(record.ttl_sec as _),
        ) {
            Ok(address) => address,
            Err(e) => {
                debug!("Dropping address record for {}: {}", record.name, e);
                continue;
            }
        };

        if record.ttl_sec == 0 {
            remove_address(addresses, address.key());
        } else if let Err(e) = upsert_address(addresses, address) {
            debug!("Dropping address record for {}: {}", record.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(literal: &str, at: Instant, ttl_sec: u64) -> DeviceAddress {
        DeviceAddress::new(
            literal.parse::<IpAddr>().unwrap(),
            5540,
            "",
            at,
            Duration::from_secs(ttl_sec),
        )
        .unwrap()
    }

    fn commissionable_data(d: u16) -> TxtData {
        let mut data = TxtData::default();
        data.d = Some(d);
        data.cm = Some(1);
        data
    }

    fn aaaa_record(name: &str, ttl_sec: u32, literal: &str) -> DnsRecord {
        DnsRecord {
            name: name.try_into().unwrap(),
            ttl_sec,
            data: DnsRecordData::Aaaa(literal.parse().unwrap()),
        }
    }

    fn a_record(name: &str, ttl_sec: u32, literal: &str) -> DnsRecord {
        DnsRecord {
            name: name.try_into().unwrap(),
            ttl_sec,
            data: DnsRecordData::A(literal.parse().unwrap()),
        }
    }

    const OP_NAME: &str = "0102030405060708-AAAAAAAAAAAAAA01._matter._tcp.local";

    #[test]
    fn operational_txt_creates_and_merges() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        let mut data = TxtData::default();
        data.sii = Some(5000);
        cache.upsert_operational_txt(OP_NAME, 120, data, t0).unwrap();

        let device = cache.operational(OP_NAME).unwrap();
        assert_eq!(device.data.sii, Some(5000));
        assert!(device.addresses.is_empty());

        // A refresh merges the data and re-stamps the lifecycle,
        // preserving the addresses
        let t1 = Instant::from_millis(1000);
        upsert_address(
            &mut cache.operational_mut(OP_NAME).unwrap().addresses,
            address("fe80::1", t1, 120),
        )
        .unwrap();

        let mut data = TxtData::default();
        data.sii = Some(300);
        cache.upsert_operational_txt(OP_NAME, 240, data, t1).unwrap();

        let device = cache.operational(OP_NAME).unwrap();
        assert_eq!(device.data.sii, Some(300));
        assert_eq!(device.discovered_at, t1);
        assert_eq!(device.ttl, Duration::from_secs(240));
        assert_eq!(device.addresses.len(), 1);
    }

    #[test]
    fn zero_ttl_txt_removes_operational() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        cache
            .upsert_operational_txt(OP_NAME, 120, TxtData::default(), t0)
            .unwrap();
        assert!(cache.operational(OP_NAME).is_some());

        cache
            .upsert_operational_txt(OP_NAME, 0, TxtData::default(), t0)
            .unwrap();
        assert!(cache.operational(OP_NAME).is_none());
    }

    #[test]
    fn monotone_refresh() {
        // A refresh with a fresh timestamp never brings the expiry closer
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        cache
            .upsert_operational_txt(OP_NAME, 120, TxtData::default(), t0)
            .unwrap();
        let expiry0 = {
            let device = cache.operational(OP_NAME).unwrap();
            device.discovered_at + device.ttl
        };

        let t1 = Instant::from_millis(30_000);
        cache
            .upsert_operational_txt(OP_NAME, 120, TxtData::default(), t1)
            .unwrap();
        let expiry1 = {
            let device = cache.operational(OP_NAME).unwrap();
            device.discovered_at + device.ttl
        };

        assert!(expiry1 >= expiry0);
    }

    #[test]
    fn commissionable_txt_roundtrip() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);
        let id: InstanceName = "A5F15790B2D15AB4".try_into().unwrap();

        let created = cache
            .upsert_commissionable_txt(&id, 4500, commissionable_data(3840), t0)
            .unwrap();
        assert!(created);

        let refreshed = cache
            .upsert_commissionable_txt(&id, 4500, commissionable_data(3840), t0)
            .unwrap();
        assert!(!refreshed);

        let device = cache.commissionable(&id).unwrap();
        assert_eq!(device.d, Some(3840));

        cache
            .upsert_commissionable_txt(&id, 0, commissionable_data(3840), t0)
            .unwrap();
        assert!(cache.commissionable(&id).is_none());
    }

    #[test]
    fn query_by_filter() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        let id_a: InstanceName = "AAAA".try_into().unwrap();
        let id_b: InstanceName = "BBBB".try_into().unwrap();

        cache
            .upsert_commissionable_txt(&id_a, 4500, commissionable_data(3840), t0)
            .unwrap();
        cache
            .upsert_commissionable_txt(&id_b, 4500, commissionable_data(840), t0)
            .unwrap();

        assert_eq!(cache.query(&CommissionableFilter::Any).count(), 2);
        assert_eq!(
            cache
                .query(&CommissionableFilter::LongDiscriminator(3840))
                .count(),
            1
        );
        assert_eq!(
            cache
                .query(&CommissionableFilter::LongDiscriminator(1))
                .count(),
            0
        );
    }

    #[test]
    fn operational_srv_creates_entry_and_addresses() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        let records = [aaaa_record("host.local", 120, "fe80::1")];

        let outcome = cache
            .upsert_operational_srv(OP_NAME, 120, "host.local", 5540, &records, &[], "eth0", true, t0)
            .unwrap()
            .unwrap();

        assert!(!outcome.existed);
        assert!(!outcome.had_addresses);
        assert!(outcome.has_addresses);

        let device = cache.operational(OP_NAME).unwrap();
        assert_eq!(device.addresses.len(), 1);
        assert_eq!(device.addresses[0].key(), "fe80::1%eth0");
        assert_eq!(device.addresses[0].port, 5540);
    }

    #[test]
    fn operational_srv_zero_ttl_removes() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        let records = [aaaa_record("host.local", 120, "fd12::1")];
        cache
            .upsert_operational_srv(OP_NAME, 120, "host.local", 5540, &records, &[], "", true, t0)
            .unwrap();
        assert!(cache.operational(OP_NAME).is_some());

        let outcome = cache
            .upsert_operational_srv(OP_NAME, 0, "host.local", 5540, &[], &[], "", true, t0)
            .unwrap();

        assert!(outcome.is_none());
        assert!(cache.operational(OP_NAME).is_none());
    }

    #[test]
    fn operational_srv_filters_by_target_and_ipv4() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        // An address of another host and an A record with IPv4 disabled:
        // neither may land on the device
        let records = [
            aaaa_record("other-host.local", 120, "fd12::1"),
            a_record("host.local", 120, "192.168.1.20"),
        ];

        let outcome = cache
            .upsert_operational_srv(OP_NAME, 120, "host.local", 5540, &records, &[], "", false, t0)
            .unwrap()
            .unwrap();

        assert!(!outcome.has_addresses);
        assert!(cache.operational(OP_NAME).unwrap().addresses.is_empty());
    }

    #[test]
    fn operational_srv_uses_former_answer_context() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        let former = [aaaa_record("host.local", 120, "fd12::1")];

        let outcome = cache
            .upsert_operational_srv(OP_NAME, 120, "host.local", 5540, &[], &former, "", true, t0)
            .unwrap()
            .unwrap();

        assert!(outcome.has_addresses);
        assert_eq!(cache.operational(OP_NAME).unwrap().addresses[0].key(), "fd12::1");
    }

    #[test]
    fn commissionable_srv_needs_cached_txt() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);
        let id: InstanceName = "AAAA".try_into().unwrap();

        let records = [aaaa_record("aaaa-host.local", 120, "fd12::1")];

        // No TXT decoded yet: the SRV is not actionable
        assert!(cache
            .upsert_commissionable_srv(&id, 120, "aaaa-host.local", 5540, &records, &[], "", true, t0)
            .is_none());

        cache
            .upsert_commissionable_txt(&id, 4500, commissionable_data(3840), t0)
            .unwrap();

        let outcome = cache
            .upsert_commissionable_srv(&id, 120, "aaaa-host.local", 5540, &records, &[], "", true, t0)
            .unwrap();

        assert!(!outcome.had_addresses);
        assert!(outcome.has_addresses);
        assert_eq!(cache.commissionable(&id).unwrap().addresses[0].key(), "fd12::1");

        // The goodbye drops the whole entry
        assert!(cache
            .upsert_commissionable_srv(&id, 0, "aaaa-host.local", 5540, &[], &[], "", true, t0)
            .is_none());
        assert!(cache.commissionable(&id).is_none());
    }

    #[test]
    fn expiry_sweep() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);

        // Device TTL 120 s; one address lapsing at 60 s, one at 300 s
        cache
            .upsert_operational_txt(OP_NAME, 120, TxtData::default(), t0)
            .unwrap();
        {
            let addresses = &mut cache.operational_mut(OP_NAME).unwrap().addresses;
            upsert_address(addresses, address("fe80::1", t0, 60)).unwrap();
            upsert_address(addresses, address("fd12::1", t0, 300)).unwrap();
        }

        cache.expire(t0 + Duration::from_secs(61));
        let device = cache.operational(OP_NAME).unwrap();
        assert_eq!(device.addresses.len(), 1);
        assert_eq!(device.addresses[0].key(), "fd12::1");

        // The device record itself lapses at 120 s
        cache.expire(t0 + Duration::from_secs(121));
        assert!(cache.operational(OP_NAME).is_none());
    }

    #[test]
    fn sweep_drops_devices_with_no_addresses() {
        let mut cache = DeviceCache::new();
        let t0 = Instant::from_millis(0);
        let id: InstanceName = "AAAA".try_into().unwrap();

        cache
            .upsert_commissionable_txt(&id, 4500, commissionable_data(3840), t0)
            .unwrap();

        cache.expire(t0 + Duration::from_secs(60));
        assert!(cache.commissionable(&id).is_none());
    }
}
