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

//! The device descriptors assembled by the scanner, their address sets and
//! the deterministic ordering of discovered addresses.

use core::fmt::Write;
use core::net::IpAddr;

use embassy_time::{Duration, Instant};

use crate::error::{Error, ErrorCode};
use crate::proto::DnsName;
use crate::txt::TxtData;
use crate::utils::ipv6;

/// The maximum number of addresses tracked per device
pub const MAX_DEVICE_ADDRESSES: usize = 8;

/// The maximum length of an address key:
/// an IPv6 literal plus the `%<iface>` suffix for link-local addresses
pub const MAX_ADDRESS_KEY_LEN: usize = 64;

/// The maximum length of a commissionable service instance name
/// (the leftmost label of the advertised name)
pub const MAX_INSTANCE_NAME_LEN: usize = 33;

pub type InstanceName = heapless::String<MAX_INSTANCE_NAME_LEN>;

/// A single IP endpoint of a discovered device.
///
/// The textual `key` - the IP literal, with the receiving interface appended
/// as `%<iface>` for link-local IPv6 - is the uniqueness key within a device,
/// so the same literal received on two interfaces coexists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    key: heapless::String<MAX_ADDRESS_KEY_LEN>,
    pub ip: IpAddr,
    pub port: u16,
    pub discovered_at: Instant,
    pub ttl: Duration,
}

impl DeviceAddress {
    pub fn new(
        ip: IpAddr,
        port: u16,
        interface: &str,
        discovered_at: Instant,
        ttl: Duration,
    ) -> Result<Self, Error> {
        let mut key = heapless::String::new();

        match ip {
            IpAddr::V6(addr) if ipv6::is_unicast_link_local(&addr) && !interface.is_empty() => {
                write!(key, "{}%{}", addr, interface)?;
            }
            other => write!(key, "{}", other)?,
        }

        Ok(Self {
            key,
            ip,
            port,
            discovered_at,
            ttl,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.discovered_at + self.ttl <= now
    }
}

fn rank(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V6(addr) if ipv6::is_unique_local(addr) => 0,
        IpAddr::V6(addr) if ipv6::is_unicast_link_local(addr) => 1,
        IpAddr::V6(_) => 2,
        IpAddr::V4(_) => 3,
    }
}

/// Order addresses by reachability preference: IPv6 unique-local first, then
/// IPv6 link-local, then other IPv6, then IPv4. The sort is stable, so
/// addresses of equal rank keep their discovery order.
pub fn sort_addresses(addresses: &mut [DeviceAddress]) {
    for i in 1..addresses.len() {
        let mut j = i;

        while j > 0 && rank(&addresses[j - 1].ip) > rank(&addresses[j].ip) {
            addresses.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Add or refresh an address in a device's address set, keyed by the textual
/// address key
pub fn upsert_address(
    addresses: &mut heapless::Vec<DeviceAddress, MAX_DEVICE_ADDRESSES>,
    address: DeviceAddress,
) -> Result<(), Error> {
    if let Some(existing) = addresses.iter_mut().find(|a| a.key == address.key) {
        *existing = address;
        Ok(())
    } else {
        addresses
            .push(address)
            .map_err(|_| Error::new(ErrorCode::NoSpace))
    }
}

/// Remove the address with the given key, if present (zero-TTL goodbye)
pub fn remove_address(
    addresses: &mut heapless::Vec<DeviceAddress, MAX_DEVICE_ADDRESSES>,
    key: &str,
) {
    addresses.retain(|a| a.key != key);
}

/// Drop all addresses whose own TTL has lapsed
pub fn expire_addresses(
    addresses: &mut heapless::Vec<DeviceAddress, MAX_DEVICE_ADDRESSES>,
    now: Instant,
) {
    addresses.retain(|a| !a.expired(now));
}

/// An operational (already commissioned) Matter node, keyed by its full
/// service instance name `<fabric-hex>-<node-hex>._matter._tcp.local`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationalDevice {
    pub name: DnsName,
    pub addresses: heapless::Vec<DeviceAddress, MAX_DEVICE_ADDRESSES>,
    pub discovered_at: Instant,
    pub ttl: Duration,
    pub data: TxtData,
}

impl OperationalDevice {
    pub fn new(name: DnsName, discovered_at: Instant, ttl: Duration) -> Self {
        Self {
            name,
            addresses: heapless::Vec::new(),
            discovered_at,
            ttl,
            data: TxtData::default(),
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.discovered_at + self.ttl <= now
    }
}

/// A Matter node advertising itself for commissioning, keyed by the instance
/// id (the leftmost label of the advertised service instance name)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionableDevice {
    pub instance_id: InstanceName,
    pub addresses: heapless::Vec<DeviceAddress, MAX_DEVICE_ADDRESSES>,
    pub discovered_at: Instant,
    pub ttl: Duration,
    /// Long discriminator
    pub d: Option<u16>,
    /// Short discriminator; derived from `D` when not advertised
    pub sd: Option<u8>,
    /// Commissioning mode: 0 (not commissioning), 1 (standard), 2 (enhanced)
    pub cm: u8,
    /// Device type
    pub dt: Option<u32>,
    /// Vendor id, split out of `VP`
    pub v: Option<u16>,
    /// Product id, split out of `VP`
    pub p: Option<u16>,
    pub data: TxtData,
}

impl CommissionableDevice {
    /// Create a descriptor from a freshly parsed TXT payload
    /// (which is guaranteed to carry `D` and `CM`)
    pub fn new(
        instance_id: InstanceName,
        data: TxtData,
        discovered_at: Instant,
        ttl: Duration,
    ) -> Self {
        let mut device = Self {
            instance_id,
            addresses: heapless::Vec::new(),
            discovered_at,
            ttl,
            d: None,
            sd: None,
            cm: 0,
            dt: None,
            v: None,
            p: None,
            data: TxtData::default(),
        };

        device.update_data(data, discovered_at, ttl);

        device
    }

    /// Refresh the identifier surface from a newer TXT payload, preserving
    /// the address set
    pub fn update_data(&mut self, data: TxtData, discovered_at: Instant, ttl: Duration) {
        self.discovered_at = discovered_at;
        self.ttl = ttl;

        self.d = data.d;
        self.sd = data.d.map(|d| ((d >> 8) & 0x0f) as u8);
        self.cm = data.cm.unwrap_or(0);
        self.dt = data.dt;

        let (v, p) = data.vendor_product();
        self.v = v;
        self.p = p;

        self.data = data;
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.discovered_at + self.ttl <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(literal: &str, iface: &str) -> DeviceAddress {
        DeviceAddress::new(
            literal.parse().unwrap(),
            5540,
            iface,
            Instant::from_millis(0),
            Duration::from_secs(120),
        )
        .unwrap()
    }

    #[test]
    fn link_local_key_carries_interface() {
        assert_eq!(addr("fe80::1", "eth0").key(), "fe80::1%eth0");
        assert_eq!(addr("fe80::1", "").key(), "fe80::1");
        // Non-link-local addresses never carry the suffix
        assert_eq!(addr("fd12::1", "eth0").key(), "fd12::1");
        assert_eq!(addr("192.168.1.20", "eth0").key(), "192.168.1.20");
    }

    #[test]
    fn same_literal_on_two_interfaces_coexists() {
        let mut addresses = heapless::Vec::new();

        upsert_address(&mut addresses, addr("fe80::1", "eth0")).unwrap();
        upsert_address(&mut addresses, addr("fe80::1", "wlan0")).unwrap();

        assert_eq!(addresses.len(), 2);
    }

    #[test]
    fn upsert_refreshes_by_key() {
        let mut addresses = heapless::Vec::new();

        upsert_address(&mut addresses, addr("fd12::1", "")).unwrap();

        let mut refreshed = addr("fd12::1", "");
        refreshed.ttl = Duration::from_secs(240);
        upsert_address(&mut addresses, refreshed).unwrap();

        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].ttl, Duration::from_secs(240));
    }

    #[test]
    fn sort_order() {
        let mut addresses = [
            addr("192.168.1.20", ""),
            addr("2001:db8::1", ""),
            addr("fe80::1", "eth0"),
            addr("fd12::1", ""),
        ];

        sort_addresses(&mut addresses);

        let keys = addresses.iter().map(|a| a.key()).collect::<heapless::Vec<_, 4>>();
        assert_eq!(
            keys.as_slice(),
            &["fd12::1", "fe80::1%eth0", "2001:db8::1", "192.168.1.20"]
        );
    }

    #[test]
    fn sort_is_stable() {
        // Two addresses of the same rank keep their discovery order,
        // for any permutation of the other entries
        let first = addr("fd12::1", "");
        let second = addr("fd12::2", "");

        let mut addresses = [
            addr("192.168.1.20", ""),
            first.clone(),
            addr("fe80::1", "eth0"),
            second.clone(),
        ];

        sort_addresses(&mut addresses);

        assert_eq!(addresses[0], first);
        assert_eq!(addresses[1], second);
    }

    #[test]
    fn short_discriminator_derived() {
        let mut data = TxtData::default();
        data.d = Some(3840);
        data.cm = Some(2);

        let device = CommissionableDevice::new(
            "ABCD".try_into().unwrap(),
            data,
            Instant::from_millis(0),
            Duration::from_secs(4500),
        );

        assert_eq!(device.sd, Some(0x0f));
        assert_eq!(device.cm, 2);
    }

    #[test]
    fn update_data_preserves_addresses() {
        let mut data = TxtData::default();
        data.d = Some(840);
        data.cm = Some(1);
        data.vp = Some("65521+32768".try_into().unwrap());

        let mut device = CommissionableDevice::new(
            "ABCD".try_into().unwrap(),
            data.clone(),
            Instant::from_millis(0),
            Duration::from_secs(4500),
        );

        upsert_address(&mut device.addresses, addr("fd12::1", "")).unwrap();

        data.cm = Some(2);
        device.update_data(data, Instant::from_millis(1000), Duration::from_secs(4500));

        assert_eq!(device.addresses.len(), 1);
        assert_eq!(device.cm, 2);
        assert_eq!(device.sd, Some(3));
        assert_eq!(device.v, Some(65521));
        assert_eq!(device.p, Some(32768));
    }
}
