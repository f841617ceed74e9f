/*
 * vPipe mail delivery pipeline
 * Copyright (C) 2023 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

//! Authentication results (RFC 8601) and DMARC (RFC 7489) policy handling
//! for the vPipe message pipeline.
//!
//! Concrete SPF/DKIM verification is the business of check implementations;
//! this crate owns the result model they produce, the combined
//! `Authentication-Results` header and the DMARC record/alignment logic the
//! pipeline enforces.

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

/// DMARC record parsing, policy lookup and alignment evaluation.
pub mod dmarc;
mod results;

pub use results::{format_header, AuthResult, DkimResult, DmarcResult, SpfResult, Value};
