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

//! Filter criteria for commissionable device discovery.

use core::fmt::Write;

use crate::device::{CommissionableDevice, InstanceName};
use crate::proto::DnsName;
use crate::MATTER_COMMISSION_SERVICE_NAME;

/// A filter for commissionable Matter devices.
///
/// Each variant maps to one canonical query identifier - the key under which
/// an active query and its waiter are registered - and, where DNS-SD defines
/// one, to a sub-service name queried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommissionableFilter {
    /// Any commissionable device
    #[default]
    Any,
    /// A specific service instance id (the leftmost label of the advertised name)
    Instance(InstanceName),
    /// The full 12-bit discriminator
    LongDiscriminator(u16),
    /// The upper 4 bits of the discriminator
    ShortDiscriminator(u8),
    /// Vendor and product id. DNS-SD defines no combined sub-service, so the
    /// wire query falls back to the vendor sub-service and the product id is
    /// filtered locally
    VendorProduct(u16, u16),
    /// Vendor id
    Vendor(u16),
    /// Device type
    DeviceType(u32),
    /// Product id. No sub-service exists; filtered locally out of the
    /// commission service browse
    Product(u16),
}

impl CommissionableFilter {
    /// The canonical identifier under which queries and waiters for this
    /// filter are registered.
    ///
    /// For the wire-queryable variants this equals the queried name;
    /// `VendorProduct`, `Product` and `Any` use internal keys.
    pub fn query_id(&self) -> DnsName {
        let mut id = DnsName::new();

        match self {
            Self::Any => unwrap_write(write!(id, "_CM")),
            Self::Instance(instance_id) => {
                unwrap_write(write!(id, "{}.{}", instance_id, MATTER_COMMISSION_SERVICE_NAME))
            }
            Self::LongDiscriminator(d) => unwrap_write(write!(
                id,
                "_L{}._sub.{}",
                d, MATTER_COMMISSION_SERVICE_NAME
            )),
            Self::ShortDiscriminator(sd) => unwrap_write(write!(
                id,
                "_S{}._sub.{}",
                sd, MATTER_COMMISSION_SERVICE_NAME
            )),
            Self::VendorProduct(v, p) => unwrap_write(write!(id, "_VP{}+{}", v, p)),
            Self::Vendor(v) => unwrap_write(write!(
                id,
                "_V{}._sub.{}",
                v, MATTER_COMMISSION_SERVICE_NAME
            )),
            Self::DeviceType(dt) => unwrap_write(write!(
                id,
                "_T{}._sub.{}",
                dt, MATTER_COMMISSION_SERVICE_NAME
            )),
            Self::Product(p) => unwrap_write(write!(id, "_P{}", p)),
        }

        id
    }

    /// The service name to browse for on the wire, when the filter has one
    /// beyond the enclosing commission service (which is always queried)
    pub fn service_name(&self) -> Option<DnsName> {
        match self {
            Self::Any | Self::Product(_) => None,
            Self::Instance(_)
            | Self::LongDiscriminator(_)
            | Self::ShortDiscriminator(_)
            | Self::Vendor(_)
            | Self::DeviceType(_) => Some(self.query_id()),
            // No combined sub-service; browse the enclosing vendor sub-service
            Self::VendorProduct(v, _) => Some(Self::Vendor(*v).query_id()),
        }
    }

    /// Whether a cached device satisfies the filter
    pub fn matches(&self, device: &CommissionableDevice) -> bool {
        match self {
            Self::Any => true,
            Self::Instance(instance_id) => {
                device.instance_id.eq_ignore_ascii_case(instance_id)
            }
            Self::LongDiscriminator(d) => device.d == Some(*d),
            Self::ShortDiscriminator(sd) => device.sd == Some(*sd),
            Self::VendorProduct(v, p) => device.v == Some(*v) && device.p == Some(*p),
            Self::Vendor(v) => device.v == Some(*v),
            Self::DeviceType(dt) => device.dt == Some(*dt),
            Self::Product(p) => device.p == Some(*p),
        }
    }
}

/// The filters which could have produced an active query matching the given
/// device, in the order in which the correlation layer probes them
pub fn active_query_candidates(
    device: &CommissionableDevice,
) -> heapless::Vec<CommissionableFilter, 8> {
    let mut candidates = heapless::Vec::new();

    let mut push = |filter| {
        // Capacity fits all possible candidates
        let _ = candidates.push(filter);
    };

    push(CommissionableFilter::Instance(device.instance_id.clone()));

    if let Some(d) = device.d {
        push(CommissionableFilter::LongDiscriminator(d));
    }

    if let Some(sd) = device.sd {
        push(CommissionableFilter::ShortDiscriminator(sd));
    }

    if let (Some(v), Some(p)) = (device.v, device.p) {
        push(CommissionableFilter::VendorProduct(v, p));
    }

    if let Some(v) = device.v {
        push(CommissionableFilter::Vendor(v));
    }

    if let Some(dt) = device.dt {
        push(CommissionableFilter::DeviceType(dt));
    }

    if let Some(p) = device.p {
        push(CommissionableFilter::Product(p));
    }

    push(CommissionableFilter::Any);

    candidates
}

// All query id forms fit `DnsName` by construction
fn unwrap_write(result: core::fmt::Result) {
    result.unwrap()
}
