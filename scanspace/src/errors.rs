/*
* Licensed to Elasticsearch B.V. under one or more contributor
* license agreements. See the NOTICE file distributed with
* this work for additional information regarding copyright
* ownership. Elasticsearch B.V. licenses this file to you under
* the Apache License, Version 2.0 (the "License"); you may
* not use this file except in compliance with the License.
* You may obtain a copy of the License at
*
*  http://www.apache.org/licenses/LICENSE-2.0
*
* Unless required by applicable law or agreed to in writing,
* software distributed under the License is distributed on an
* "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
* KIND, either express or implied.  See the License for the
* specific language governing permissions and limitations
* under the License.
*/

//! The errors that can occur when measurement lists are ingested. A rejected
//! scan leaves the consumer untouched; the next scan proceeds normally.

use std::error::Error;
use std::fmt;
use std::io;

/// Helper type for an ingest call that could go wrong.
pub type ScanResult<T> = Result<T, ScanError>;

/// Error type for the measurement layer.
#[derive(Debug)]
pub enum ScanError {
    /// A measurement, state or timestamp contained a NaN or infinity.
    /// `index` is the offending entry, `None` for the list timestamp itself.
    NonFiniteValue {
        /// Index of the offending entry in the list.
        index: Option<usize>,
    },
    /// The AIS list did not carry the same timestamp as the radar scan.
    AisTimeMismatch {
        /// Timestamp of the radar scan.
        radar: f64,
        /// Timestamp of the AIS delivery.
        ais: f64,
    },
    /// A scan arrived with a timestamp at or before the previous one.
    NonMonotonicTime {
        /// Timestamp of the previously accepted scan.
        last: f64,
        /// Timestamp of the rejected scan.
        next: f64,
    },
    /// IO error when writing result files.
    IoError(io::Error),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ScanError::NonFiniteValue { index: Some(i) } => {
                write!(f, "entry {} of the measurement list is not finite", i)
            }
            ScanError::NonFiniteValue { index: None } => {
                write!(f, "the list timestamp is not finite")
            }
            ScanError::AisTimeMismatch { radar, ais } => write!(
                f,
                "AIS delivery time {} does not match the radar scan time {}",
                ais, radar
            ),
            ScanError::NonMonotonicTime { last, next } => write!(
                f,
                "scan time {} is not after the previous scan time {}",
                next, last
            ),
            ScanError::IoError(ref e) => write!(f, "{}", e),
        }
    }
}

impl Error for ScanError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            ScanError::IoError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ScanError {
    fn from(err: io::Error) -> Self {
        ScanError::IoError(err)
    }
}
