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

//! The errors that can occur while the tracker is running. Ingest problems are
//! floated up from `scanspace`; the variants added here cover the association
//! solver and the internal consistency checks. A solver or invariant error
//! aborts the scan it occurred in, an ingest error rejects the scan before it
//! touches any state.

use scanspace::ScanError;
use std::error::Error;
use std::fmt;
use std::io;

/// Helper type for a tracker call that could go wrong.
pub type TomhtResult<T> = Result<T, TomhtError>;

/// Error type for the tracker.
#[derive(Debug)]
pub enum TomhtError {
    /// The incoming measurement list failed validation; the scan was rejected.
    Scan(ScanError),
    /// The association solver did not return an optimal selection.
    Solver {
        /// What the solver reported.
        reason: &'static str,
    },
    /// An internal consistency check failed. This is a bug, not bad input.
    Invariant {
        /// Which invariant was violated.
        message: String,
    },
    /// IO error when persisting results.
    IoError(io::Error),
}

impl fmt::Display for TomhtError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TomhtError::Scan(ref e) => write!(f, "{}", e),
            TomhtError::Solver { reason } => {
                write!(f, "the association solver failed: {}", reason)
            }
            TomhtError::Invariant { ref message } => {
                write!(f, "tracker integrity violated: {}", message)
            }
            TomhtError::IoError(ref e) => write!(f, "{}", e),
        }
    }
}

impl Error for TomhtError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            TomhtError::Scan(ref e) => Some(e),
            TomhtError::IoError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<ScanError> for TomhtError {
    fn from(err: ScanError) -> Self {
        TomhtError::Scan(err)
    }
}

impl From<io::Error> for TomhtError {
    fn from(err: io::Error) -> Self {
        TomhtError::IoError(err)
    }
}
