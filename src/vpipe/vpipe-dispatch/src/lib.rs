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

//! The vPipe dispatch engine.
//!
//! Takes one in-flight message and drives it through the routing
//! configuration: global checks and modifiers, source-block resolution on
//! the sender, recipient-block resolution per recipient, fan-out to the
//! delivery targets and the final commit or abort. Front-end listeners
//! (SMTP, Submission, LMTP) call [`Pipeline::start`] once a session knows
//! its sender; everything transaction-scoped lives in the returned
//! [`Delivery`].

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

mod config;
mod pipeline;
mod routing;
mod status;

pub use config::{
    reject_directive, RcptBlock, RoutingConfig, RoutingConfigBuilder, SourceBlock,
};
pub use pipeline::{Delivery, Pipeline};
pub use status::AutoresolveSink;
