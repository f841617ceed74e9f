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

use crate::{Body, Error, Header, MsgMetadata, Reply};

/// Per-recipient status sink used by non-atomic body delivery.
pub trait StatusCollector: Send {
    /// Record the outcome of delivering the current message to `rcpt_to`.
    fn set_status(&mut self, rcpt_to: &str, status: Result<(), Reply>);
}

/// A terminal consumer of messages: mailbox storage, an outbound relay
/// queue, ...
///
/// Targets are shared, long-lived objects; everything transaction-scoped
/// lives in the [`TargetDelivery`] returned by [`DeliveryTarget::start`].
#[async_trait::async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Name of the target, used in logs.
    fn name(&self) -> &str;

    /// Open a delivery for one transaction.
    ///
    /// # Errors
    ///
    /// * the target refuses the sender or cannot accept mail right now.
    async fn start(
        &self,
        meta: &MsgMetadata,
        mail_from: &str,
    ) -> Result<Box<dyn TargetDelivery>, Error>;
}

/// An open, transaction-scoped delivery on a target.
///
/// The pipeline owns the handle from `start` until `commit` or `abort`.
#[async_trait::async_trait]
pub trait TargetDelivery: Send {
    /// Add a recipient to the delivery.
    ///
    /// # Errors
    ///
    /// * the target refuses the recipient.
    async fn add_rcpt(&mut self, rcpt_to: &str) -> Result<(), Error>;

    /// Deliver the message atomically to all recipients added so far.
    ///
    /// # Errors
    ///
    /// * the delivery failed as a whole.
    async fn body(&mut self, header: &Header, body: &dyn Body) -> Result<(), Error>;

    /// Does this delivery support per-recipient status reporting? When
    /// `false` (the default), the pipeline calls [`Self::body`] instead and
    /// broadcasts its outcome to every recipient of this target.
    fn supports_partial(&self) -> bool {
        false
    }

    /// Deliver the message, reporting a status per recipient through
    /// `sink`. Only invoked when [`Self::supports_partial`] returns `true`.
    async fn body_non_atomic(
        &mut self,
        sink: &mut dyn StatusCollector,
        header: &Header,
        body: &dyn Body,
    ) {
        let _ = (sink, header, body);
        debug_assert!(
            false,
            "partial delivery invoked on a target that does not advertise it"
        );
    }

    /// Make the delivery final.
    ///
    /// # Errors
    ///
    /// * the target could not persist or forward the message.
    async fn commit(&mut self) -> Result<(), Error>;

    /// Discard the delivery, rolling back whatever can be rolled back.
    ///
    /// # Errors
    ///
    /// * part of the delivery could not be undone.
    async fn abort(&mut self) -> Result<(), Error>;
}

/// Accepts and silently discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blackhole;

#[async_trait::async_trait]
impl DeliveryTarget for Blackhole {
    fn name(&self) -> &str {
        "blackhole"
    }

    async fn start(
        &self,
        _meta: &MsgMetadata,
        _mail_from: &str,
    ) -> Result<Box<dyn TargetDelivery>, Error> {
        Ok(Box::new(BlackholeDelivery))
    }
}

#[derive(Debug)]
struct BlackholeDelivery;

#[async_trait::async_trait]
impl TargetDelivery for BlackholeDelivery {
    async fn add_rcpt(&mut self, _rcpt_to: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn body(&mut self, _header: &Header, _body: &dyn Body) -> Result<(), Error> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), Error> {
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBody, Protocol};

    #[tokio::test]
    async fn blackhole_swallows_everything() {
        let meta = MsgMetadata::new(Protocol::Smtp, "mx.example.com", "a@example.com");
        let mut delivery = Blackhole.start(&meta, "a@example.com").await.unwrap();

        delivery.add_rcpt("b@example.com").await.unwrap();
        delivery
            .body(&Header::new(), &MemoryBody::from("hello"))
            .await
            .unwrap();
        delivery.commit().await.unwrap();
        assert!(!delivery.supports_partial());
    }
}
