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

//! Policy checks and their per-message runner.
//!
//! A check is a read-mostly probe attached to a routing block: it observes
//! the transaction phase by phase and produces a [`CheckResult`] which may
//! add headers, adjust the message score, request quarantine or reject the
//! transaction outright. The [`CheckRunner`] owns one state object per
//! check per message, executes a phase concurrently across checks and
//! merges their results.

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

mod dmarc;
mod runner;

pub use runner::{CheckRunner, Thresholds};

use vpipe_common::{
    sync::CancellationToken, Body, ConnectionState, Error, Header, HeaderField, MsgMetadata,
    Reply,
};
use vpipe_auth::AuthResult;

/// Outcome of one check at one phase.
#[derive(Debug, Default)]
pub struct CheckResult {
    /// Reject the transaction with this error. The first reject produced
    /// within a phase wins; the others are discarded.
    pub reject: Option<Error>,
    /// Request quarantine of the message without rejecting it.
    pub quarantine: bool,
    /// Signed adjustment of the message score.
    pub score_adjust: i32,
    /// Authentication results to merge into the combined
    /// `Authentication-Results` header.
    pub auth_results: Vec<AuthResult>,
    /// Header fields to stamp on the message, in order.
    pub headers: Vec<HeaderField>,
}

impl CheckResult {
    /// A result that changes nothing.
    #[must_use]
    #[inline]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A result rejecting the transaction with `reply`.
    #[must_use]
    #[inline]
    pub fn reject(reply: Reply) -> Self {
        Self {
            reject: Some(reply.into()),
            ..Self::default()
        }
    }
}

/// A policy check, instantiated once per configuration and shared across
/// transactions.
#[async_trait::async_trait]
pub trait Check: Send + Sync {
    /// Name of the check, used in logs.
    fn name(&self) -> &str;

    /// Does this check participate in early (pre-transaction) filtering?
    fn supports_early(&self) -> bool {
        false
    }

    /// Reject-only probe run before any transaction state exists. Only
    /// invoked when [`Self::supports_early`] returns `true`.
    ///
    /// # Errors
    ///
    /// * the connection must be rejected.
    async fn check_early(&self, state: &ConnectionState) -> Result<(), Error> {
        let _ = state;
        Ok(())
    }

    /// Create the per-message state for one transaction.
    fn new_state(&self, meta: &MsgMetadata) -> Box<dyn CheckState>;
}

/// Per-message state of one check.
///
/// A state created after the transaction progressed is replayed through the
/// phases it missed, so every state observes the connection, the sender and
/// each recipient exactly once, in order. Implementations must honor the
/// cancellation token they are given and return promptly once it fires.
#[async_trait::async_trait]
pub trait CheckState: Send {
    /// Observe the client connection.
    async fn check_connection(&mut self, token: &CancellationToken) -> CheckResult {
        let _ = token;
        CheckResult::ok()
    }

    /// Observe the (possibly rewritten) envelope sender.
    async fn check_sender(&mut self, token: &CancellationToken, mail_from: &str) -> CheckResult {
        let _ = (token, mail_from);
        CheckResult::ok()
    }

    /// Observe one envelope recipient.
    async fn check_rcpt(&mut self, token: &CancellationToken, rcpt_to: &str) -> CheckResult {
        let _ = (token, rcpt_to);
        CheckResult::ok()
    }

    /// Observe the message content.
    async fn check_body(
        &mut self,
        token: &CancellationToken,
        header: &Header,
        body: &dyn Body,
    ) -> CheckResult {
        let _ = (token, header, body);
        CheckResult::ok()
    }

    /// Release whatever the state holds.
    ///
    /// # Errors
    ///
    /// * cleanup failed; the error is logged by the runner.
    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// A check handle with the stable identifier assigned at registration.
///
/// Register each check instance once and clone the handle into every
/// routing block that references it; the runner uses the identifier to
/// keep exactly one state per check per message.
#[derive(Clone)]
pub struct RegisteredCheck {
    id: usize,
    check: std::sync::Arc<dyn Check>,
}

impl RegisteredCheck {
    /// Stable identifier of the check instance.
    #[must_use]
    #[inline]
    pub const fn id(&self) -> usize {
        self.id
    }

    ///
    #[must_use]
    #[inline]
    pub fn check(&self) -> &dyn Check {
        &*self.check
    }
}

impl std::fmt::Debug for RegisteredCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCheck")
            .field("id", &self.id)
            .field("name", &self.check.name())
            .finish()
    }
}

/// Assigns stable identifiers to check instances while the configuration
/// is built. Once the routing tree is frozen no further registration
/// happens.
#[derive(Debug, Default)]
pub struct CheckRegistry {
    next_id: usize,
}

impl CheckRegistry {
    ///
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `check` with the next free identifier.
    pub fn register(&mut self, check: std::sync::Arc<dyn Check>) -> RegisteredCheck {
        let id = self.next_id;
        self.next_id += 1;
        RegisteredCheck { id, check }
    }
}
