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

//! Decoding of the Matter-specific key/value TXT payload advertised by both
//! operational and commissionable nodes.

use core::str::FromStr;

/// The maximum length of the raw `VP` (vendor+product) value, `65535+65535`
pub const MAX_VP_LEN: usize = 11;

/// The maximum length of the advertised device name (`DN`), per the Matter spec
pub const MAX_DEVICE_NAME_LEN: usize = 32;

/// The maximum length of the rotating device identifier (`RI`), per the Matter spec
pub const MAX_ROTATING_ID_LEN: usize = 100;

/// The maximum length of the pairing instruction (`PI`) the scanner retains
pub const MAX_PAIRING_INST_LEN: usize = 64;

/// The structured decode of a Matter discovery TXT record.
///
/// Keys which fail to parse are dropped; unknown keys are ignored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TxtData {
    /// Session idle interval (`SII`), ms
    pub sii: Option<u32>,
    /// Session active interval (`SAI`), ms
    pub sai: Option<u32>,
    /// Session active threshold (`SAT`), ms
    pub sat: Option<u32>,
    /// TCP support bitmap (`T`); the reserved value 1 is clamped to 0
    pub t: u8,
    /// Intermittently-connected-device mode (`ICD`); 0 when not advertised
    pub icd: u8,
    /// Long discriminator (`D`), commissionable only
    pub d: Option<u16>,
    /// Commissioning mode (`CM`), commissionable only
    pub cm: Option<u8>,
    /// Device type (`DT`)
    pub dt: Option<u32>,
    /// Pairing hint bitmap (`PH`)
    pub ph: Option<u32>,
    /// Raw vendor+product (`VP`), in `<vendor>+<product>` form
    pub vp: Option<heapless::String<MAX_VP_LEN>>,
    /// Device name (`DN`)
    pub dn: Option<heapless::String<MAX_DEVICE_NAME_LEN>>,
    /// Rotating device identifier (`RI`)
    pub ri: Option<heapless::String<MAX_ROTATING_ID_LEN>>,
    /// Pairing instruction (`PI`)
    pub pi: Option<heapless::String<MAX_PAIRING_INST_LEN>>,
}

impl TxtData {
    /// Decode a TXT payload from its `key=value` character strings.
    ///
    /// Never fails: items without `=`, with a non-UTF8 key or value, or with
    /// an unparseable integer value are skipped.
    pub fn parse<'a>(items: impl Iterator<Item = &'a [u8]>) -> Self {
        let mut data = Self::default();

        for item in items {
            let Some(eq_pos) = item.iter().position(|&b| b == b'=') else {
                continue;
            };

            let (Ok(key), Ok(value)) = (
                core::str::from_utf8(&item[..eq_pos]),
                core::str::from_utf8(&item[eq_pos + 1..]),
            ) else {
                continue;
            };

            data.set_value(key, value);
        }

        // 1 is a reserved T value and is to be treated as "no TCP support"
        if data.t == 1 {
            data.t = 0;
        }

        data
    }

    /// Same as `parse`, but enforcing the presence of the `D` and `CM` keys
    /// which every commissionable advertisement must carry. Returns `None`
    /// (record to be discarded) when either is missing.
    pub fn parse_commissionable<'a>(items: impl Iterator<Item = &'a [u8]>) -> Option<Self> {
        let data = Self::parse(items);

        (data.d.is_some() && data.cm.is_some()).then_some(data)
    }

    fn set_value(&mut self, key: &str, value: &str) {
        match key {
            "SII" => self.sii = parse_int(value),
            "SAI" => self.sai = parse_int(value),
            "SAT" => self.sat = parse_int(value),
            "T" => self.t = parse_int(value).unwrap_or(0),
            "ICD" => self.icd = parse_int(value).unwrap_or(0),
            "D" => self.d = parse_int(value),
            "CM" => self.cm = parse_int(value),
            "DT" => self.dt = parse_int(value),
            "PH" => self.ph = parse_int(value),
            "VP" => self.vp = value.try_into().ok(),
            "DN" => self.dn = value.try_into().ok(),
            "RI" => self.ri = value.try_into().ok(),
            "PI" => self.pi = value.try_into().ok(),
            _ => (),
        }
    }

    /// Split the raw `VP` value into its vendor and product halves.
    ///
    /// A `VP` without the `+` separator carries the vendor id only.
    pub fn vendor_product(&self) -> (Option<u16>, Option<u16>) {
        let Some(vp) = self.vp.as_ref() else {
            return (None, None);
        };

        match vp.split_once('+') {
            Some((vendor, product)) => (parse_int(vendor), parse_int(product)),
            None => (parse_int(vp), None),
        }
    }
}

fn parse_int<T: FromStr>(value: &str) -> Option<T> {
    value.parse().ok()
}
