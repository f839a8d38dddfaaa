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

//! The wire side of the scanner: building query messages (with known-answer
//! suppression and truncation into multiple fragments) and parsing response
//! messages into a typed record model.
//!
//! This is the only module which talks to the `domain` DNS codec.

use core::fmt::Write;
use core::net::{Ipv4Addr, Ipv6Addr};

use domain::base::header::Flags;
use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use domain::base::message::ShortMessage;
use domain::base::message_builder::{AnswerBuilder, PushError};
use domain::base::name::FromStrError;
use domain::base::record::ParsedRecord;
use domain::base::wire::{Composer, ParseError};
use domain::base::{Message, MessageBuilder, Name};
use domain::dep::octseq::Truncate;
use domain::dep::octseq::{OctetsBuilder, ShortBuf};
use domain::rdata::{Aaaa, Ptr, Srv, Txt, A};

use log::{debug, warn};

use crate::error::{Error, ErrorCode};
use crate::MAX_DNS_NAME_LEN;

/// The maximum number of records the scanner processes out of a single
/// received message (answers and additional records combined)
pub const MAX_PACKET_RECORDS: usize = 32;

/// The maximum raw TXT payload the scanner can track per record
pub const MAX_TXT_VALUE_LEN: usize = 256;

/// A DNS name in its textual form, as tracked by the scanner
/// (lower-cased comparisons, no trailing dot)
pub type DnsName = heapless::String<MAX_DNS_NAME_LEN>;

impl From<ShortBuf> for Error {
    fn from(_: ShortBuf) -> Self {
        Self::new(ErrorCode::NoSpace)
    }
}

impl From<PushError> for Error {
    fn from(_: PushError) -> Self {
        Self::new(ErrorCode::NoSpace)
    }
}

impl From<FromStrError> for Error {
    fn from(_: FromStrError) -> Self {
        Self::new(ErrorCode::MdnsError)
    }
}

impl From<ShortMessage> for Error {
    fn from(_: ShortMessage) -> Self {
        Self::new(ErrorCode::MdnsError)
    }
}

impl From<ParseError> for Error {
    fn from(_: ParseError) -> Self {
        Self::new(ErrorCode::MdnsError)
    }
}

/// The record types the scanner queries for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsQueryType {
    A,
    Aaaa,
    Ptr,
    Srv,
    Txt,
    Any,
}

impl DnsQueryType {
    fn rtype(&self) -> Rtype {
        match self {
            Self::A => Rtype::A,
            Self::Aaaa => Rtype::AAAA,
            Self::Ptr => Rtype::PTR,
            Self::Srv => Rtype::SRV,
            Self::Txt => Rtype::TXT,
            Self::Any => Rtype::ANY,
        }
    }
}

/// A single question, always of class IN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: DnsName,
    pub qtype: DnsQueryType,
}

impl DnsQuery {
    pub fn new(name: &str, qtype: DnsQueryType) -> Result<Self, Error> {
        Ok(Self {
            name: name.try_into().map_err(|_| ErrorCode::InvalidArgument)?,
            qtype,
        })
    }
}

/// The rdata of the record types the scanner understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRecordData {
    Ptr(DnsName),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: DnsName,
    },
    /// The raw TXT payload: a sequence of length-prefixed character strings
    Txt(heapless::Vec<u8, MAX_TXT_VALUE_LEN>),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
}

impl DnsRecordData {
    pub fn query_type(&self) -> DnsQueryType {
        match self {
            Self::Ptr(_) => DnsQueryType::Ptr,
            Self::Srv { .. } => DnsQueryType::Srv,
            Self::Txt(_) => DnsQueryType::Txt,
            Self::A(_) => DnsQueryType::A,
            Self::Aaaa(_) => DnsQueryType::Aaaa,
        }
    }
}

/// A single decoded resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: DnsName,
    pub ttl_sec: u32,
    pub data: DnsRecordData,
}

impl DnsRecord {
    /// Append the record to the answer section being built.
    ///
    /// On `Err` the builder is unchanged (the `domain` builders roll back
    /// partial pushes), so a failed push can be retried in a fresh fragment.
    fn push_to<T: Composer>(&self, answer: &mut AnswerBuilder<T>) -> Result<(), Error> {
        let name = dns_name(&self.name)?;

        match &self.data {
            DnsRecordData::Ptr(target) => {
                let target = dns_name(target)?;
                answer.push((name, Class::IN, self.ttl_sec, Ptr::new(target)))?;
            }
            DnsRecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                let target = dns_name(target)?;
                answer.push((
                    name,
                    Class::IN,
                    self.ttl_sec,
                    Srv::new(*priority, *weight, *port, target),
                ))?;
            }
            DnsRecordData::Txt(payload) => {
                let txt = Txt::from_octets(payload.as_slice())
                    .map_err(|_| Error::new(ErrorCode::MdnsError))?;
                answer.push((name, Class::IN, self.ttl_sec, txt))?;
            }
            DnsRecordData::A(ip) => {
                let octets = ip.octets();
                answer.push((
                    name,
                    Class::IN,
                    self.ttl_sec,
                    A::from_octets(octets[0], octets[1], octets[2], octets[3]),
                ))?;
            }
            DnsRecordData::Aaaa(ip) => {
                answer.push((name, Class::IN, self.ttl_sec, Aaaa::new(ip.octets().into())))?;
            }
        }

        Ok(())
    }
}

/// An iterator over the character strings of a raw TXT payload
pub struct TxtItems<'a>(&'a [u8]);

impl<'a> TxtItems<'a> {
    pub const fn new(payload: &'a [u8]) -> Self {
        Self(payload)
    }
}

impl<'a> Iterator for TxtItems<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (len, rest) = self.0.split_first()?;

        if rest.len() < *len as usize {
            self.0 = &[];
            return None;
        }

        let (item, rest) = rest.split_at(*len as usize);
        self.0 = rest;

        Some(item)
    }
}

/// Check if two domain names match
pub fn names_match(name1: &str, name2: &str) -> bool {
    name1
        .trim_end_matches('.')
        .eq_ignore_ascii_case(name2.trim_end_matches('.'))
}

/// Check if a record name is an instance of the given service type
/// (`<label(s)>.<service>`, case-insensitive, trailing dots ignored)
pub fn name_in_service(name: &str, service: &str) -> bool {
    let name = name.trim_end_matches('.');

    name.len() > service.len()
        && name.as_bytes()[name.len() - service.len() - 1] == b'.'
        && name[name.len() - service.len()..].eq_ignore_ascii_case(service)
}

fn dns_name(name: &str) -> Result<Name<heapless::Vec<u8, 64>>, FromStrError> {
    Name::from_chars(name.trim_end_matches('.').chars())
}

fn stored_name(name: impl core::fmt::Display) -> Result<DnsName, Error> {
    let mut out = DnsName::new();
    write!(out, "{}", name)?;

    while out.ends_with('.') {
        out.pop();
    }

    Ok(out)
}

/// Build a single query message fragment.
///
/// Every fragment carries all `queries`; `answers` are the known answers not
/// yet marshalled in a previous fragment. Returns the message length, the
/// number of answers consumed and whether the message was finished with the
/// Truncated flag set (i.e. more fragments must follow carrying the remaining
/// answers).
///
/// An answer which does not fit even as the sole answer of a fragment is
/// logged and counted as consumed without being marshalled, as no message
/// can carry it; it stays in the caller's known-answer list for later rounds.
pub fn build_query(
    queries: &[DnsQuery],
    answers: &[DnsRecord],
    buf: &mut [u8],
) -> Result<(usize, usize, bool), Error> {
    let buf = Buf(buf, 0);
    let message = MessageBuilder::from_target(buf)?;

    let mut question = message.question();

    let header = question.header_mut();
    header.set_id(0); // mDNS queries use ID 0
    header.set_opcode(Opcode::QUERY);
    header.set_rcode(Rcode::NOERROR);

    let mut flags = Flags::new();
    flags.qr = false;
    header.set_flags(flags);

    for query in queries {
        // Note: no QU (unicast response requested) bit. We want multicast
        // responses so all listeners receive them.
        let name = dns_name(&query.name)?;
        question.push((&name, query.qtype.rtype(), Class::IN))?;
    }

    let mut answer = question.answer();

    let mut consumed = 0;
    let mut truncated = false;

    for record in answers {
        match record.push_to(&mut answer) {
            Ok(()) => consumed += 1,
            Err(_) if consumed == 0 => {
                // The protocol allows no smaller message than one with a
                // single known answer; an answer which still does not fit
                // cannot be marshalled at all
                warn!(
                    "Known answer for {} exceeds the maximum mDNS message size, skipping",
                    record.name
                );
                consumed += 1;
            }
            Err(_) => {
                truncated = true;
                break;
            }
        }
    }

    if truncated {
        let header = answer.header_mut();
        let mut flags = header.flags();
        flags.tc = true;
        header.set_flags(flags);
    }

    let buf = answer.finish();

    Ok((buf.1, consumed, truncated))
}

/// Parse a received message.
///
/// Returns `false` (leaving `records` untouched) when the message is not a
/// response; otherwise collects the records of the answer and additional
/// sections - truncated responses are accepted like regular ones, as the
/// correlation layer reconstructs multi-packet context from the known-answer
/// lists of its active queries.
///
/// Records of unknown types, with malformed rdata or with names too long to
/// track are skipped. A hard `Err` means the packet is to be ignored.
pub fn parse_response(
    data: &[u8],
    records: &mut heapless::Vec<DnsRecord, MAX_PACKET_RECORDS>,
) -> Result<bool, Error> {
    let message = Message::from_octets(data)?;

    // Check if this is a response (QR=1)
    if !message.header().flags().qr {
        return Ok(false);
    }

    for record in message.answer()?.flatten() {
        collect_record(record, records);
    }

    for record in message.additional()?.flatten() {
        collect_record(record, records);
    }

    Ok(true)
}

fn collect_record<'a>(
    record: ParsedRecord<'a, &'a [u8]>,
    records: &mut heapless::Vec<DnsRecord, MAX_PACKET_RECORDS>,
) {
    let converted = match convert_record(record) {
        Ok(converted) => converted,
        Err(_) => {
            debug!("Skipping unparseable record in mDNS response");
            return;
        }
    };

    if let Some(converted) = converted {
        if records.push(converted).is_err() {
            debug!("Too many records in mDNS response, extra records dropped");
        }
    }
}

fn convert_record(record: ParsedRecord<'_, &[u8]>) -> Result<Option<DnsRecord>, Error> {
    let name = stored_name(record.owner())?;

    if let Some(ptr) = record.to_record::<Ptr<_>>()? {
        return Ok(Some(DnsRecord {
            name,
            ttl_sec: ptr.ttl().as_secs(),
            data: DnsRecordData::Ptr(stored_name(ptr.data().ptrdname())?),
        }));
    }

    if let Some(srv) = record.to_record::<Srv<_>>()? {
        return Ok(Some(DnsRecord {
            name,
            ttl_sec: srv.ttl().as_secs(),
            data: DnsRecordData::Srv {
                priority: srv.data().priority(),
                weight: srv.data().weight(),
                port: srv.data().port(),
                target: stored_name(srv.data().target())?,
            },
        }));
    }

    if let Some(txt) = record.to_record::<Txt<_>>()? {
        // Re-marshal the character strings the way they appear on the wire,
        // so the payload can be carried verbatim in known-answer lists
        let mut payload = heapless::Vec::new();

        for item in txt.data().iter() {
            payload
                .push(item.len() as u8)
                .map_err(|_| ErrorCode::NoSpace)?;
            payload
                .extend_from_slice(item)
                .map_err(|_| ErrorCode::NoSpace)?;
        }

        return Ok(Some(DnsRecord {
            name,
            ttl_sec: txt.ttl().as_secs(),
            data: DnsRecordData::Txt(payload),
        }));
    }

    if let Some(a) = record.to_record::<A>()? {
        return Ok(Some(DnsRecord {
            name,
            ttl_sec: a.ttl().as_secs(),
            data: DnsRecordData::A(Ipv4Addr::from(a.data().addr().octets())),
        }));
    }

    if let Some(aaaa) = record.to_record::<Aaaa>()? {
        return Ok(Some(DnsRecord {
            name,
            ttl_sec: aaaa.ttl().as_secs(),
            data: DnsRecordData::Aaaa(Ipv6Addr::from(aaaa.data().addr().octets())),
        }));
    }

    Ok(None)
}

struct Buf<'a>(pub &'a mut [u8], pub usize);

impl Composer for Buf<'_> {}

impl OctetsBuilder for Buf<'_> {
    type AppendError = ShortBuf;

    fn append_slice(&mut self, slice: &[u8]) -> Result<(), Self::AppendError> {
        if self.1 + slice.len() <= self.0.len() {
            let end = self.1 + slice.len();
            self.0[self.1..end].copy_from_slice(slice);
            self.1 = end;

            Ok(())
        } else {
            Err(ShortBuf)
        }
    }
}

impl Truncate for Buf<'_> {
    fn truncate(&mut self, len: usize) {
        self.1 = len;
    }
}

impl AsMut<[u8]> for Buf<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0[..self.1]
    }
}

impl AsRef<[u8]> for Buf<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0[..self.1]
    }
}
