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

use core::fmt;
use core::str::Utf8Error;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ErrorCode {
    /// A discovery call was made on a scanner which is already closed
    InvalidState,
    /// An argument is outside of the domain the scanner can represent
    /// (e.g. a DNS name longer than `MAX_DNS_NAME_LEN`)
    InvalidArgument,
    /// An mDNS message could not be parsed or marshalled
    MdnsError,
    /// One of the fixed-capacity stores of the scanner is full
    NoSpace,
    /// UTF-8 decoding failure in a received record
    Utf8Fail,
    StdIoError,
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

pub struct Error {
    code: ErrorCode,
}

impl Error {
    pub const fn new(code: ErrorCode) -> Self {
        Self { code }
    }

    pub const fn code(&self) -> ErrorCode {
        self.code
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(_e: std::io::Error) -> Self {
        Self::new(ErrorCode::StdIoError)
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Self {
        Self::new(ErrorCode::Utf8Fail)
    }
}

impl From<fmt::Error> for Error {
    fn from(_e: fmt::Error) -> Self {
        Self::new(ErrorCode::NoSpace)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{:?}", self.code())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code())
    }
}
