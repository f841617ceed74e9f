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

//! Message modifiers: possibly-mutating transforms applied to the sender,
//! the recipients and the message content, serially in configured order.

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

mod alias;

pub use alias::AliasFile;

use vpipe_common::{Body, Error, Header, MsgMetadata};

/// A content or envelope transform, instantiated once per configuration
/// and shared across transactions.
#[async_trait::async_trait]
pub trait Modifier: Send + Sync {
    /// Name of the modifier, used in logs.
    fn name(&self) -> &str;

    /// Create the per-message state for one transaction.
    fn new_state(&self, meta: &MsgMetadata) -> Box<dyn ModifierState>;
}

/// Per-message state of one modifier.
#[async_trait::async_trait]
pub trait ModifierState: Send {
    /// Rewrite the envelope sender.
    ///
    /// # Errors
    ///
    /// * the rewrite failed; the transaction is aborted.
    async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String, Error> {
        Ok(mail_from.to_owned())
    }

    /// Rewrite one envelope recipient.
    ///
    /// # Errors
    ///
    /// * the rewrite failed; the transaction is aborted.
    async fn rewrite_rcpt(&mut self, rcpt_to: &str) -> Result<String, Error> {
        Ok(rcpt_to.to_owned())
    }

    /// Rewrite the message header; the body is readable for context.
    ///
    /// # Errors
    ///
    /// * the rewrite failed; the transaction is aborted.
    async fn rewrite_body(&mut self, header: &mut Header, body: &dyn Body) -> Result<(), Error> {
        let _ = (header, body);
        Ok(())
    }

    /// Release whatever the state holds.
    ///
    /// # Errors
    ///
    /// * cleanup failed.
    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// An ordered set of modifiers applied as one.
///
/// Application is strictly serial: the output of one modifier feeds the
/// next, and the first error aborts the chain.
#[derive(Clone, Default)]
pub struct Group {
    modifiers: Vec<std::sync::Arc<dyn Modifier>>,
}

impl Group {
    ///
    #[must_use]
    pub fn new(modifiers: Vec<std::sync::Arc<dyn Modifier>>) -> Self {
        Self { modifiers }
    }

    /// A group with no modifiers; every rewrite is the identity.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    ///
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    /// Create the combined per-message state.
    #[must_use]
    pub fn new_state(&self, meta: &MsgMetadata) -> GroupState {
        GroupState {
            states: self
                .modifiers
                .iter()
                .map(|modifier| (modifier.name().to_owned(), modifier.new_state(meta)))
                .collect(),
            closed: false,
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modifiers.iter().map(|modifier| modifier.name()))
            .finish()
    }
}

/// Combined per-message state of a [`Group`].
pub struct GroupState {
    states: Vec<(String, Box<dyn ModifierState>)>,
    closed: bool,
}

impl GroupState {
    /// Chain the sender through every modifier, in order.
    ///
    /// # Errors
    ///
    /// * a modifier failed; the chain is aborted.
    pub async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String, Error> {
        let mut current = mail_from.to_owned();
        for (_, state) in &mut self.states {
            current = state.rewrite_sender(&current).await?;
        }
        Ok(current)
    }

    /// Chain one recipient through every modifier, in order.
    ///
    /// # Errors
    ///
    /// * a modifier failed; the chain is aborted.
    pub async fn rewrite_rcpt(&mut self, rcpt_to: &str) -> Result<String, Error> {
        let mut current = rcpt_to.to_owned();
        for (_, state) in &mut self.states {
            current = state.rewrite_rcpt(&current).await?;
        }
        Ok(current)
    }

    /// Apply every body rewrite, in order.
    ///
    /// # Errors
    ///
    /// * a modifier failed; the chain is aborted.
    pub async fn rewrite_body(
        &mut self,
        header: &mut Header,
        body: &dyn Body,
    ) -> Result<(), Error> {
        for (_, state) in &mut self.states {
            state.rewrite_body(header, body).await?;
        }
        Ok(())
    }

    /// Close every state. Errors do not stop the sweep; the last one is
    /// returned, earlier ones are logged.
    ///
    /// # Errors
    ///
    /// * at least one state failed to close.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut last_error = None;
        for (name, state) in &mut self.states {
            if let Err(error) = state.close().await {
                if let Some(previous) = last_error.replace(error) {
                    tracing::warn!(modifier = %name, error = %previous, "modifier close failed");
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vpipe_common::{MemoryBody, Protocol, Reply};

    struct Suffix(&'static str);

    #[async_trait::async_trait]
    impl Modifier for Suffix {
        fn name(&self) -> &str {
            "suffix"
        }

        fn new_state(&self, _meta: &MsgMetadata) -> Box<dyn ModifierState> {
            Box::new(SuffixState(self.0))
        }
    }

    struct SuffixState(&'static str);

    #[async_trait::async_trait]
    impl ModifierState for SuffixState {
        async fn rewrite_rcpt(&mut self, rcpt_to: &str) -> Result<String, Error> {
            Ok(format!("{rcpt_to}{}", self.0))
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Modifier for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn new_state(&self, _meta: &MsgMetadata) -> Box<dyn ModifierState> {
            Box::new(FailingState)
        }
    }

    struct FailingState;

    #[async_trait::async_trait]
    impl ModifierState for FailingState {
        async fn rewrite_rcpt(&mut self, _rcpt_to: &str) -> Result<String, Error> {
            Err(Reply::internal_temporary().into())
        }

        async fn close(&mut self) -> Result<(), Error> {
            Err(Reply::internal_temporary().into())
        }
    }

    fn meta() -> MsgMetadata {
        MsgMetadata::new(Protocol::Smtp, "mx.example.com", "a@example.com")
    }

    #[tokio::test]
    async fn serial_application_in_order() {
        let group = Group::new(vec![
            std::sync::Arc::new(Suffix(".one")),
            std::sync::Arc::new(Suffix(".two")),
        ]);
        let mut state = group.new_state(&meta());
        assert_eq!(
            state.rewrite_rcpt("user@example.com").await.unwrap(),
            "user@example.com.one.two"
        );
    }

    #[tokio::test]
    async fn first_error_aborts_the_chain() {
        let group = Group::new(vec![
            std::sync::Arc::new(Failing),
            std::sync::Arc::new(Suffix(".never")),
        ]);
        let mut state = group.new_state(&meta());
        assert!(state.rewrite_rcpt("user@example.com").await.is_err());
    }

    #[tokio::test]
    async fn close_aggregates_and_returns_last_error() {
        let group = Group::new(vec![
            std::sync::Arc::new(Failing),
            std::sync::Arc::new(Failing),
        ]);
        let mut state = group.new_state(&meta());
        assert!(state.close().await.is_err());
        // second close is a no-op.
        assert!(state.close().await.is_ok());
    }

    #[tokio::test]
    async fn empty_group_is_identity() {
        let mut state = Group::empty().new_state(&meta());
        assert_eq!(
            state.rewrite_sender("a@example.com").await.unwrap(),
            "a@example.com"
        );
        let mut header = Header::new();
        state
            .rewrite_body(&mut header, &MemoryBody::from(""))
            .await
            .unwrap();
        assert!(header.is_empty());
    }
}
