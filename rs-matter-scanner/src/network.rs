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

//! The network interface of the scanner: UDP multicast constants and the
//! send/receive traits through which the transport is consumed.

pub use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::Error;

/// The standard mDNS IPv6 broadcast address
pub const MDNS_IPV6_BROADCAST_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x00fb);

/// The standard mDNS IPv4 broadcast address
pub const MDNS_IPV4_BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The standard mDNS port
pub const MDNS_PORT: u16 = 5353;

/// A default bind address for mDNS sockets. Binds to all available interfaces
pub const MDNS_SOCKET_DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0));

/// Maximum UDP RX packet size
pub const MAX_RX_PACKET_SIZE: usize = 1583;

/// The maximum length of a network interface name
pub const MAX_INTERFACE_NAME_LEN: usize = 16;

/// The name of the network interface a datagram was received on.
///
/// Used to annotate link-local IPv6 addresses (`fe80::1%eth0`), so that the
/// same literal on different interfaces does not collide in the device cache.
pub type InterfaceName = heapless::String<MAX_INTERFACE_NAME_LEN>;

pub trait NetworkSend {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<(), Error>;
}

impl<T> NetworkSend for &mut T
where
    T: NetworkSend,
{
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<(), Error> {
        (*self).send_to(data, addr).await
    }
}

pub trait NetworkReceive {
    async fn wait_available(&mut self) -> Result<(), Error>;

    /// Receive a single datagram.
    ///
    /// Returns the datagram length, the remote address and the name of the
    /// interface the datagram arrived on (empty when unknown).
    async fn recv_from(
        &mut self,
        buffer: &mut [u8],
    ) -> Result<(usize, SocketAddr, InterfaceName), Error>;
}

impl<T> NetworkReceive for &mut T
where
    T: NetworkReceive,
{
    async fn wait_available(&mut self) -> Result<(), Error> {
        (*self).wait_available().await
    }

    async fn recv_from(
        &mut self,
        buffer: &mut [u8],
    ) -> Result<(usize, SocketAddr, InterfaceName), Error> {
        (*self).recv_from(buffer).await
    }
}

#[cfg(all(feature = "std", feature = "async-io"))]
mod async_io {
    use std::net::UdpSocket;

    use async_io::Async;

    use crate::error::Error;

    use super::{InterfaceName, NetworkReceive, NetworkSend, SocketAddr};

    impl NetworkSend for &Async<UdpSocket> {
        async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<(), Error> {
            Async::<UdpSocket>::send_to(self, data, addr).await?;

            Ok(())
        }
    }

    /// A `NetworkReceive` implementation over an `async-io` UDP socket.
    ///
    /// The OS does not report the ingress interface per datagram without
    /// platform-specific socket options, so the receiver is constructed with
    /// the name of the interface its socket is bound to.
    pub struct UdpReceiver<'a> {
        socket: &'a Async<UdpSocket>,
        interface: InterfaceName,
    }

    impl<'a> UdpReceiver<'a> {
        pub const fn new(socket: &'a Async<UdpSocket>, interface: InterfaceName) -> Self {
            Self { socket, interface }
        }
    }

    impl NetworkReceive for UdpReceiver<'_> {
        async fn wait_available(&mut self) -> Result<(), Error> {
            self.socket.readable().await?;

            Ok(())
        }

        async fn recv_from(
            &mut self,
            buffer: &mut [u8],
        ) -> Result<(usize, SocketAddr, InterfaceName), Error> {
            let (len, addr) = Async::<UdpSocket>::recv_from(self.socket, buffer).await?;

            Ok((len, addr, self.interface.clone()))
        }
    }
}

#[cfg(all(feature = "std", feature = "async-io"))]
pub use self::async_io::UdpReceiver;
