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

//! End-to-end discovery scenarios, driving a scanner over a fake in-memory
//! network.

use core::cell::RefCell;
use core::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};

use rs_matter_scanner::error::Error;
use rs_matter_scanner::filter::CommissionableFilter;
use rs_matter_scanner::network::{InterfaceName, NetworkReceive, NetworkSend};
use rs_matter_scanner::proto::{
    build_query, DnsRecord, DnsRecordData, MAX_TXT_VALUE_LEN,
};
use rs_matter_scanner::scanner::{operational_instance_name, MdnsScanner, ScannerConfig};
use rs_matter_scanner::MAX_MDNS_MESSAGE_SIZE;

const FABRIC_ID: u64 = 0x0102030405060708;
const NODE_ID: u64 = 0xAAAAAAAAAAAAAA01;

const REMOTE: SocketAddr = SocketAddr::V6(SocketAddrV6::new(
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x99),
    5353,
    0,
    0,
));

type Packet = heapless::Vec<u8, MAX_MDNS_MESSAGE_SIZE>;

/// A fake UDP network: datagrams sent by the scanner are collected for
/// inspection, datagrams pushed by the test are delivered to its receiver
struct TestNetwork {
    rx: Channel<NoopRawMutex, Packet, 8>,
    tx: RefCell<Vec<Vec<u8>>>,
}

impl TestNetwork {
    fn new() -> Self {
        Self {
            rx: Channel::new(),
            tx: RefCell::new(Vec::new()),
        }
    }

    async fn inject(&self, packet: &[u8]) {
        self.rx
            .send(Packet::from_slice(packet).unwrap())
            .await;
    }

    fn sent(&self) -> usize {
        self.tx.borrow().len()
    }
}

struct TestSend<'a>(&'a TestNetwork);

impl NetworkSend for TestSend<'_> {
    async fn send_to(&mut self, data: &[u8], _addr: SocketAddr) -> Result<(), Error> {
        self.0.tx.borrow_mut().push(data.to_vec());

        Ok(())
    }
}

struct TestRecv<'a>(&'a TestNetwork);

impl NetworkReceive for TestRecv<'_> {
    async fn wait_available(&mut self) -> Result<(), Error> {
        Ok(())
    }

    async fn recv_from(
        &mut self,
        buffer: &mut [u8],
    ) -> Result<(usize, SocketAddr, InterfaceName), Error> {
        let packet = self.0.rx.receive().await;

        buffer[..packet.len()].copy_from_slice(&packet);

        Ok((packet.len(), REMOTE, "eth0".try_into().unwrap()))
    }
}

fn txt(name: &str, ttl_sec: u32, items: &[&str]) -> DnsRecord {
    let mut payload = heapless::Vec::<u8, MAX_TXT_VALUE_LEN>::new();

    for item in items {
        payload.push(item.len() as u8).unwrap();
        payload.extend_from_slice(item.as_bytes()).unwrap();
    }

    DnsRecord {
        name: name.try_into().unwrap(),
        ttl_sec,
        data: DnsRecordData::Txt(payload),
    }
}

fn srv(name: &str, ttl_sec: u32, port: u16, target: &str) -> DnsRecord {
    DnsRecord {
        name: name.try_into().unwrap(),
        ttl_sec,
        data: DnsRecordData::Srv {
            priority: 0,
            weight: 0,
            port,
            target: target.try_into().unwrap(),
        },
    }
}

fn aaaa(name: &str, ttl_sec: u32, ip: &str) -> DnsRecord {
    DnsRecord {
        name: name.try_into().unwrap(),
        ttl_sec,
        data: DnsRecordData::Aaaa(ip.parse().unwrap()),
    }
}

/// The result of the test leg of a `select(scanner.run(..), test)` pair;
/// the run leg never completes on its own
fn test_leg<A, B>(either: Either<A, B>) -> B {
    match either {
        Either::First(_) => panic!("scanner run ended unexpectedly"),
        Either::Second(result) => result,
    }
}

/// Marshal the records into a response message: encode them as the known
/// answers of a query, then flip the QR bit
fn response(records: &[DnsRecord]) -> Vec<u8> {
    let mut buf = [0; MAX_MDNS_MESSAGE_SIZE];

    let (len, consumed, truncated) = build_query(&[], records, &mut buf).unwrap();
    assert_eq!(consumed, records.len());
    assert!(!truncated);

    buf[2] |= 0x80;

    buf[..len].to_vec()
}

fn operational_response(addresses: &[(&str, u32)]) -> Vec<u8> {
    let name = operational_instance_name(FABRIC_ID, NODE_ID);

    let mut records = vec![
        txt(&name, 4500, &["SII=5000", "SAI=300", "T=0"]),
        srv(&name, 120, 5540, "node-aaaa01.local"),
    ];

    for (ip, ttl_sec) in addresses {
        records.push(aaaa("node-aaaa01.local", *ttl_sec, ip));
    }

    response(&records)
}

fn commissionable_response(instance: &str, d: u16, vp: &str, address: Option<&str>) -> Vec<u8> {
    let name = format!("{}._matterc._udp.local", instance);
    let host = format!("{}-host.local", instance);

    let d_item = format!("D={}", d);
    let vp_item = format!("VP={}", vp);

    let mut records = vec![
        txt(&name, 4500, &[&d_item, "CM=2", &vp_item]),
        srv(&name, 120, 5540, &host),
    ];

    if let Some(ip) = address {
        records.push(aaaa(&host, 120, ip));
    }

    response(&records)
}

#[test]
fn operational_discovery_resolves_on_response() {
    let scanner = MdnsScanner::new(ScannerConfig::new());
    let network = TestNetwork::new();

    let device = test_leg(block_on(select(
        scanner.run(TestSend(&network), TestRecv(&network), None, Some(1)),
        async {
            join(
                scanner.find_operational_device(
                    FABRIC_ID,
                    NODE_ID,
                    Some(Duration::from_secs(5)),
                    false,
                ),
                async {
                    // Let the query go out first
                    Timer::after(Duration::from_millis(100)).await;
                    network
                        .inject(&operational_response(&[("fe80::1", 120)]))
                        .await;
                },
            )
            .await
            .0
            .unwrap()
        },
    )));

    let device = device.expect("device not discovered");

    assert_eq!(device.addresses.len(), 1);
    assert_eq!(device.addresses[0].key(), "fe80::1%eth0");
    assert_eq!(device.addresses[0].port, 5540);
    assert_eq!(device.data.sii, Some(5000));

    // At least the initial broadcast went out before the response arrived
    assert!(network.sent() >= 1);
}

#[test]
fn operational_discovery_times_out_empty() {
    let scanner = MdnsScanner::new(ScannerConfig::new());
    let network = TestNetwork::new();

    let device = test_leg(block_on(select(
        scanner.run(TestSend(&network), TestRecv(&network), None, Some(1)),
        async {
            scanner
                .find_operational_device(
                    FABRIC_ID,
                    NODE_ID,
                    Some(Duration::from_millis(1700)),
                    false,
                )
                .await
                .unwrap()
        },
    )));

    assert!(device.is_none());

    // The query was broadcast at t=0 and re-broadcast at t=1.5s
    assert!(network.sent() >= 2, "got {} broadcasts", network.sent());
}

#[test]
fn cached_commissionable_devices_need_no_network() {
    let scanner = MdnsScanner::new(ScannerConfig::new());

    // Prime the cache directly through the ingest path
    scanner.handle_response(
        &commissionable_response("A5F15790B2D15AB4", 3840, "65521+32768", Some("fd12::1")),
        REMOTE,
        "eth0",
    );

    // No `run` is active: a hit can only come out of the cache
    let devices = block_on(scanner.find_commissionable_devices(
        &CommissionableFilter::Vendor(65521),
        Duration::from_secs(5),
        false,
    ))
    .unwrap();

    assert_eq!(devices.len(), 1);

    let device = &devices[0];
    assert_eq!(device.instance_id, "A5F15790B2D15AB4");
    assert_eq!(device.d, Some(3840));
    assert_eq!(device.sd, Some(0x0f));
    assert_eq!(device.cm, 2);
    assert_eq!(device.v, Some(65521));
    assert_eq!(device.p, Some(32768));
    assert_eq!(device.addresses[0].key(), "fd12::1");

    // The other identifier surfaces hit the same cache entry
    assert_eq!(
        scanner
            .get_discovered_commissionable_devices(&CommissionableFilter::LongDiscriminator(3840))
            .len(),
        1
    );
    assert_eq!(
        scanner
            .get_discovered_commissionable_devices(&CommissionableFilter::VendorProduct(
                65521, 32768
            ))
            .len(),
        1
    );
    assert!(scanner
        .get_discovered_commissionable_devices(&CommissionableFilter::LongDiscriminator(1))
        .is_empty());
}

#[test]
fn incomplete_commissionable_txt_is_discarded() {
    let scanner = MdnsScanner::new(ScannerConfig::new());

    let name = "ABCD1234._matterc._udp.local";

    // No CM key: the record is unusable for commissioning
    let packet = response(&[
        txt(name, 4500, &["D=3840"]),
        srv(name, 120, 5540, "abcd-host.local"),
        aaaa("abcd-host.local", 120, "fd12::1"),
    ]);

    scanner.handle_response(&packet, REMOTE, "eth0");

    assert!(scanner
        .get_discovered_commissionable_devices(&CommissionableFilter::Any)
        .is_empty());
}

#[test]
fn operational_goodbye_purges_device() {
    let scanner = MdnsScanner::new(ScannerConfig::new());
    let name = operational_instance_name(FABRIC_ID, NODE_ID);

    scanner.handle_response(&operational_response(&[("fe80::1", 120)]), REMOTE, "eth0");
    assert!(scanner
        .get_discovered_operational_device(FABRIC_ID, NODE_ID)
        .is_some());

    // A zero-TTL TXT is a goodbye for the whole record
    scanner.handle_response(&response(&[txt(&name, 0, &["SII=5000"])]), REMOTE, "eth0");

    assert!(scanner
        .get_discovered_operational_device(FABRIC_ID, NODE_ID)
        .is_none());
}

#[test]
fn address_arrives_in_follow_up_packet() {
    // A truncated response can deliver the SRV and the AAAA in separate
    // packets; the follow-up address query carries the first packet's
    // answers as known answers, which provide the SRV context when the
    // address finally arrives
    let scanner = MdnsScanner::new(ScannerConfig::new());
    let name = operational_instance_name(FABRIC_ID, NODE_ID);

    let device = block_on(
        join(
            scanner.find_operational_device(
                FABRIC_ID,
                NODE_ID,
                Some(Duration::from_secs(5)),
                false,
            ),
            async {
                // TXT + SRV only: the device has no addresses yet, so the
                // waiter must not be woken
                scanner.handle_response(
                    &response(&[
                        txt(&name, 4500, &["SII=5000"]),
                        srv(&name, 120, 5540, "node-aaaa01.local"),
                    ]),
                    REMOTE,
                    "eth0",
                );

                assert!(scanner
                    .get_discovered_operational_device(FABRIC_ID, NODE_ID)
                    .is_none());

                // The AAAA alone: correlated back to the device through the
                // known-answer context installed by the follow-up query
                scanner.handle_response(
                    &response(&[aaaa("node-aaaa01.local", 120, "fe80::1")]),
                    REMOTE,
                    "eth0",
                );
            },
        ),
    )
    .0
    .unwrap();

    let device = device.expect("device not discovered");
    assert_eq!(device.addresses[0].key(), "fe80::1%eth0");
}

#[test]
fn txt_refresh_wakes_waiter_for_known_device() {
    // An unsolicited TXT-only re-announcement of a device whose addresses
    // are already cached resolves a pending discovery immediately - it does
    // not have to wait for an SRV of its own
    let scanner = MdnsScanner::new(ScannerConfig::new());
    let name = operational_instance_name(FABRIC_ID, NODE_ID);

    scanner.handle_response(&operational_response(&[("fd12::1", 120)]), REMOTE, "eth0");

    let device = block_on(
        join(
            scanner.find_operational_device(
                FABRIC_ID,
                NODE_ID,
                Some(Duration::from_secs(30)),
                true,
            ),
            async {
                scanner.handle_response(
                    &response(&[txt(&name, 4500, &["SII=300"])]),
                    REMOTE,
                    "eth0",
                );
            },
        ),
    )
    .0
    .unwrap();

    let device = device.expect("waiter not resolved by the TXT refresh");
    assert_eq!(device.data.sii, Some(300));
    assert_eq!(device.addresses[0].key(), "fd12::1");
}

#[test]
fn streaming_discovery_reports_each_device_once() {
    let scanner = MdnsScanner::new(ScannerConfig::new());
    let network = TestNetwork::new();

    let reported = test_leg(block_on(select(
        scanner.run(TestSend(&network), TestRecv(&network), None, Some(1)),
        async {
            let reported = RefCell::new(Vec::new());

            join(
                async {
                    scanner
                        .find_commissionable_devices_continuously(
                            &CommissionableFilter::Any,
                            Duration::from_millis(600),
                            None,
                            |device| reported.borrow_mut().push(device.instance_id.clone()),
                        )
                        .await
                        .unwrap();
                },
                async {
                    Timer::after(Duration::from_millis(50)).await;
                    network
                        .inject(&commissionable_response("AAAA", 3840, "1+1", Some("fd12::1")))
                        .await;

                    Timer::after(Duration::from_millis(100)).await;
                    network
                        .inject(&commissionable_response("BBBB", 841, "2+2", Some("fd12::2")))
                        .await;

                    // A re-announcement of an already reported device
                    Timer::after(Duration::from_millis(100)).await;
                    network
                        .inject(&commissionable_response("AAAA", 3840, "1+1", Some("fd12::1")))
                        .await;
                },
            )
            .await;

            reported.into_inner()
        },
    )));

    assert_eq!(reported.len(), 2);
    assert_eq!(reported[0], "AAAA");
    assert_eq!(reported[1], "BBBB");
}

#[test]
fn streaming_discovery_cancels() {
    let scanner = MdnsScanner::new(ScannerConfig::new());
    let cancel = Signal::new();

    let started = std::time::Instant::now();

    block_on(join(
        scanner.find_commissionable_devices_continuously(
            &CommissionableFilter::Any,
            Duration::from_secs(30),
            Some(&cancel),
            |_| {},
        ),
        async {
            Timer::after(Duration::from_millis(50)).await;
            cancel.signal(());
        },
    ))
    .0
    .unwrap();

    // Canceled long before the 30 s deadline
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[test]
fn close_resolves_pending_discoveries() {
    let scanner = MdnsScanner::new(ScannerConfig::new());

    let device = block_on(
        join(
            scanner.find_operational_device(
                FABRIC_ID,
                NODE_ID,
                Some(Duration::from_secs(30)),
                false,
            ),
            async {
                Timer::after(Duration::from_millis(50)).await;
                scanner.close();
            },
        ),
    )
    .0
    .unwrap();

    assert!(device.is_none());

    // Discovery calls after close are refused
    assert!(block_on(scanner.find_operational_device(FABRIC_ID, NODE_ID, None, false)).is_err());
}

#[test]
fn addresses_sorted_by_scope() {
    let scanner = MdnsScanner::new(ScannerConfig::new());

    // Addresses arriving in "wrong" order: link-local first, then
    // unique-local; the result puts the unique-local one first
    scanner.handle_response(
        &operational_response(&[("fe80::1", 120), ("fd12::1", 120)]),
        REMOTE,
        "eth0",
    );

    let device = scanner
        .get_discovered_operational_device(FABRIC_ID, NODE_ID)
        .unwrap();

    assert_eq!(device.addresses.len(), 2);
    assert_eq!(device.addresses[0].key(), "fd12::1");
    assert_eq!(device.addresses[1].key(), "fe80::1%eth0");
}

#[test]
fn zero_ttl_address_is_dropped() {
    let scanner = MdnsScanner::new(ScannerConfig::new());

    scanner.handle_response(
        &operational_response(&[("fe80::1", 120), ("fd12::1", 120)]),
        REMOTE,
        "eth0",
    );

    // A goodbye for one of the two addresses
    scanner.handle_response(&operational_response(&[("fd12::1", 0)]), REMOTE, "eth0");

    let device = scanner
        .get_discovered_operational_device(FABRIC_ID, NODE_ID)
        .unwrap();

    assert_eq!(device.addresses.len(), 1);
    assert_eq!(device.addresses[0].key(), "fe80::1%eth0");
}
