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

//! vPipe common definitions: addresses, replies, message metadata, the
//! delivery-target contract and a few shared synchronization primitives.

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

mod context;
mod error;
mod message;
mod reply;
mod target;

/// Shared synchronization primitives used across the pipeline.
pub mod sync;

mod types {
    pub mod address;
    /// Domain name type used throughout the pipeline.
    pub mod domain;
}

pub use context::{delivery_id, ConnectionState, MsgMetadata, Protocol, TlsSnapshot};
pub use error::Error;
pub use message::{Body, FileBody, Header, HeaderField, MemoryBody};
pub use reply::{EnhancedCode, Reply};
pub use target::{Blackhole, DeliveryTarget, StatusCollector, TargetDelivery};
pub use types::address;
pub use types::domain;
pub use types::domain::Domain;
