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

use crate::{
    config::{RoutingConfig, SourceBlock},
    routing,
    status::AutoresolveSink,
};
use vpipe_auth::dmarc::{DnsResolver, TxtResolver};
use vpipe_check::{CheckRunner, Thresholds};
use vpipe_common::{
    delivery_id, sync::CancellationToken, Body, ConnectionState, DeliveryTarget, Error, Header,
    MsgMetadata, StatusCollector, TargetDelivery,
};
use vpipe_modify::GroupState;

/// The dispatch engine, shared by every listener.
///
/// Stateless apart from the frozen configuration: each transaction lives in
/// the [`Delivery`] returned by [`Pipeline::start`], and any number of
/// transactions may run concurrently.
pub struct Pipeline {
    cfg: std::sync::Arc<RoutingConfig>,
    resolver: Option<std::sync::Arc<dyn TxtResolver>>,
}

impl Pipeline {
    /// Pipeline over a frozen routing configuration. When DMARC is enabled
    /// the system DNS resolver is used for policy lookups.
    ///
    /// # Errors
    ///
    /// * DMARC is enabled and the system resolver configuration cannot be
    ///   read.
    pub fn new(cfg: std::sync::Arc<RoutingConfig>) -> anyhow::Result<Self> {
        let resolver = if cfg.dmarc {
            Some(std::sync::Arc::new(DnsResolver::from_system_conf()?)
                as std::sync::Arc<dyn TxtResolver>)
        } else {
            None
        };
        Ok(Self { cfg, resolver })
    }

    /// Pipeline with an explicit policy resolver, used by tests and by
    /// servers that share one resolver across subsystems.
    #[must_use]
    pub fn with_resolver(
        cfg: std::sync::Arc<RoutingConfig>,
        resolver: std::sync::Arc<dyn TxtResolver>,
    ) -> Self {
        let resolver = cfg.dmarc.then_some(resolver);
        Self { cfg, resolver }
    }

    /// Run every global check that advertises early filtering, before any
    /// transaction state exists. Reject-only: no score or quarantine side
    /// effects.
    ///
    /// # Errors
    ///
    /// * a check rejected the connection.
    pub async fn run_early_checks(&self, state: &ConnectionState) -> Result<(), Error> {
        for check in &self.cfg.checks {
            if check.check().supports_early() {
                check.check().check_early(state).await?;
            }
        }
        Ok(())
    }

    /// Open a transaction for `mail_from` (verbatim; `""` is the null
    /// reverse-path).
    ///
    /// Runs the global connection and sender checks, the global sender
    /// rewrite, resolves the source block on the rewritten sender and runs
    /// its checks and rewrite. On error everything created so far is
    /// closed; the caller gets no delivery to abort.
    ///
    /// # Errors
    ///
    /// * a check rejected the transaction.
    /// * the sender does not parse (`501 5.1.3`).
    /// * the matched source block rejects.
    #[tracing::instrument(name = "start", skip_all)]
    pub async fn start(
        &self,
        token: &CancellationToken,
        mut meta: MsgMetadata,
        mail_from: &str,
    ) -> Result<Delivery, Error> {
        meta.id = delivery_id();
        tracing::debug!(id = %meta.id, sender = %mail_from, "starting transaction");

        let runner = CheckRunner::new(
            &meta,
            Thresholds {
                reject_score: self.cfg.reject_score,
                quarantine_score: self.cfg.quarantine_score,
            },
            self.resolver.clone(),
        );
        let global_modifiers = self.cfg.modifiers.new_state(&meta);

        let mut delivery = Delivery {
            cfg: self.cfg.clone(),
            meta,
            runner,
            global_modifiers,
            source: None,
            rcpt_modifiers: Vec::new(),
            targets: Vec::new(),
            sender: mail_from.to_owned(),
            state: TxState::SenderKnown,
            states_closed: false,
        };
        if let Err(error) = delivery.run_start(token, mail_from).await {
            delivery.close_states().await;
            // no target was opened yet; the transaction ends here and the
            // caller never sees a delivery to abort.
            delivery.state = TxState::Aborted;
            return Err(error);
        }
        Ok(delivery)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    SenderKnown,
    HasRcpt,
    BodyDone,
    Committed,
    Aborted,
    Failed,
}

struct SourceScope {
    block: std::sync::Arc<SourceBlock>,
    modifiers: GroupState,
}

struct TargetSlot {
    target: std::sync::Arc<dyn DeliveryTarget>,
    delivery: Box<dyn TargetDelivery>,
    /// Recipient addresses exactly as the endpoint passed them, in call
    /// order.
    recipients: Vec<String>,
}

fn same_target(
    a: &std::sync::Arc<dyn DeliveryTarget>,
    b: &std::sync::Arc<dyn DeliveryTarget>,
) -> bool {
    std::ptr::eq(
        std::sync::Arc::as_ptr(a).cast::<()>(),
        std::sync::Arc::as_ptr(b).cast::<()>(),
    )
}

/// One message transaction, from `start` to `commit` or `abort`.
pub struct Delivery {
    cfg: std::sync::Arc<RoutingConfig>,
    meta: MsgMetadata,
    runner: CheckRunner,
    global_modifiers: GroupState,
    source: Option<SourceScope>,
    /// One modifier state per recipient block touched by this transaction.
    rcpt_modifiers: Vec<(usize, GroupState)>,
    targets: Vec<TargetSlot>,
    sender: String,
    state: TxState,
    states_closed: bool,
}

impl Delivery {
    /// The transaction metadata, including the delivery id assigned at
    /// `start` and the original-recipient map filled by `add_rcpt`.
    #[must_use]
    pub const fn metadata(&self) -> &MsgMetadata {
        &self.meta
    }

    /// The current sender, after all rewrites so far.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Add one recipient (verbatim, as received from the client).
    ///
    /// Runs the global and source recipient checks, the recipient rewrites,
    /// resolves the recipient block, runs its checks and rewrite, records
    /// the original address when a rewrite changed it, and registers the
    /// final address with every target of the block, opening target
    /// deliveries on first use.
    ///
    /// # Errors
    ///
    /// * a check rejected the recipient.
    /// * the recipient does not parse (`501 5.1.3`).
    /// * the matched recipient block rejects.
    /// * a target refused the recipient; the transaction is failed and
    ///   must be aborted.
    #[tracing::instrument(name = "rcpt", skip_all, fields(id = %self.meta.id))]
    pub async fn add_rcpt(
        &mut self,
        token: &CancellationToken,
        rcpt_to: &str,
    ) -> Result<(), Error> {
        if !matches!(self.state, TxState::SenderKnown | TxState::HasRcpt) {
            return Err(self.misuse("add_rcpt"));
        }
        match self.run_add_rcpt(token, rcpt_to).await {
            Ok(()) => {
                self.state = TxState::HasRcpt;
                Ok(())
            }
            Err(error) => {
                self.state = TxState::Failed;
                Err(error)
            }
        }
    }

    /// Deliver the message atomically: one verdict for the whole
    /// transaction.
    ///
    /// Runs the body checks (DMARC lookup overlapping), stamps the
    /// authentication results and queued header additions, enforces DMARC
    /// and scoring, applies the body rewrites and hands the message to
    /// every open target in order. The first target error fails the
    /// transaction.
    ///
    /// # Errors
    ///
    /// * a check, DMARC or the score rejected the message.
    /// * a target failed; the transaction must be aborted.
    #[tracing::instrument(name = "body", skip_all, fields(id = %self.meta.id))]
    pub async fn body(
        &mut self,
        token: &CancellationToken,
        mut header: Header,
        body: std::sync::Arc<dyn Body>,
    ) -> Result<(), Error> {
        if self.state != TxState::HasRcpt {
            return Err(self.misuse("body"));
        }
        let outcome = self.run_body_preamble(token, &mut header, &body).await;
        if let Err(error) = outcome {
            self.state = TxState::Failed;
            return Err(error);
        }
        for slot in &mut self.targets {
            if let Err(error) = slot.delivery.body(&header, body.as_ref()).await {
                tracing::error!(target = %slot.target.name(), %error, "body delivery failed");
                self.state = TxState::Failed;
                return Err(error);
            }
        }
        self.state = TxState::BodyDone;
        Ok(())
    }

    /// Deliver the message with per-recipient statuses reported through
    /// `sink`, always under the addresses the endpoint originally passed.
    ///
    /// Targets that support partial delivery report through a wrapper that
    /// reverse-maps rewritten recipients; for the others the atomic result
    /// is broadcast to all of their recipients. A failure in the shared
    /// preamble (checks, DMARC, scoring, rewrites) is reported for every
    /// recipient.
    #[tracing::instrument(name = "body", skip_all, fields(id = %self.meta.id))]
    pub async fn body_non_atomic(
        &mut self,
        token: &CancellationToken,
        sink: &mut dyn StatusCollector,
        mut header: Header,
        body: std::sync::Arc<dyn Body>,
    ) {
        if self.state != TxState::HasRcpt {
            let reply = self.misuse("body_non_atomic").to_reply();
            for slot in &self.targets {
                for rcpt in &slot.recipients {
                    sink.set_status(rcpt, Err(reply.clone()));
                }
            }
            return;
        }
        if let Err(error) = self.run_body_preamble(token, &mut header, &body).await {
            self.state = TxState::Failed;
            let reply = error.to_reply();
            for slot in &self.targets {
                for rcpt in &slot.recipients {
                    sink.set_status(rcpt, Err(reply.clone()));
                }
            }
            return;
        }
        for slot in &mut self.targets {
            if slot.delivery.supports_partial() {
                let mut wrapped = AutoresolveSink::new(sink, &self.meta.original_rcpts);
                slot.delivery
                    .body_non_atomic(&mut wrapped, &header, body.as_ref())
                    .await;
            } else {
                match slot.delivery.body(&header, body.as_ref()).await {
                    Ok(()) => {
                        for rcpt in &slot.recipients {
                            sink.set_status(rcpt, Ok(()));
                        }
                    }
                    Err(error) => {
                        tracing::error!(target = %slot.target.name(), %error, "body delivery failed");
                        let reply = error.to_reply();
                        for rcpt in &slot.recipients {
                            sink.set_status(rcpt, Err(reply.clone()));
                        }
                    }
                }
            }
        }
        self.state = TxState::BodyDone;
    }

    /// Close all check and modifier states, then commit every target in a
    /// single pass.
    ///
    /// # Errors
    ///
    /// * a target commit failed. Targets already committed stay committed
    ///   and the remaining ones are left untouched; the caller decides
    ///   whether to abort.
    #[tracing::instrument(name = "commit", skip_all, fields(id = %self.meta.id))]
    pub async fn commit(&mut self) -> Result<(), Error> {
        if self.state != TxState::BodyDone {
            return Err(self.misuse("commit"));
        }
        self.close_states().await;
        for slot in &mut self.targets {
            if let Err(error) = slot.delivery.commit().await {
                tracing::error!(target = %slot.target.name(), %error, "commit failed");
                self.state = TxState::Failed;
                return Err(error);
            }
        }
        self.state = TxState::Committed;
        Ok(())
    }

    /// Close all check and modifier states and abort every target,
    /// continuing past errors. Targets that already committed roll back
    /// best-effort and may surface an error.
    ///
    /// # Errors
    ///
    /// * at least one target abort failed; the last error is returned.
    #[tracing::instrument(name = "abort", skip_all, fields(id = %self.meta.id))]
    pub async fn abort(&mut self) -> Result<(), Error> {
        match self.state {
            TxState::Committed => return Err(self.misuse("abort")),
            TxState::Aborted => return Ok(()),
            _ => {}
        }
        self.close_states().await;
        let mut last_error = None;
        for slot in &mut self.targets {
            if let Err(error) = slot.delivery.abort().await {
                tracing::warn!(target = %slot.target.name(), %error, "target abort failed");
                last_error = Some(error);
            }
        }
        self.state = TxState::Aborted;
        last_error.map_or(Ok(()), Err)
    }

    async fn run_start(
        &mut self,
        token: &CancellationToken,
        mail_from: &str,
    ) -> Result<(), Error> {
        self.runner.check_connection(token, &self.cfg.checks).await?;
        self.runner
            .check_sender(token, &self.cfg.checks, mail_from)
            .await?;
        self.sender = self.global_modifiers.rewrite_sender(mail_from).await?;

        let source = routing::resolve(
            &self.cfg.sources,
            self.cfg.default_source.as_ref(),
            &self.sender,
        )?
        .clone();
        if let Some(reply) = &source.reject {
            return Err(reply.clone().into());
        }

        self.runner.check_connection(token, &source.checks).await?;
        self.runner
            .check_sender(token, &source.checks, &self.sender)
            .await?;

        let current = self.sender.clone();
        let modifiers = source.modifiers.new_state(&self.meta);
        let scope = self.source.insert(SourceScope {
            block: source,
            modifiers,
        });
        let rewritten = scope.modifiers.rewrite_sender(&current).await?;
        self.sender = rewritten;
        Ok(())
    }

    async fn run_add_rcpt(
        &mut self,
        token: &CancellationToken,
        rcpt_to: &str,
    ) -> Result<(), Error> {
        let source = self.source_block()?;

        self.runner
            .check_rcpt(token, &self.cfg.checks, rcpt_to)
            .await?;
        self.runner.check_rcpt(token, &source.checks, rcpt_to).await?;

        let mut rcpt = self.global_modifiers.rewrite_rcpt(rcpt_to).await?;
        if let Some(scope) = self.source.as_mut() {
            rcpt = scope.modifiers.rewrite_rcpt(&rcpt).await?;
        }

        let block =
            routing::resolve(&source.rcpts, source.default_rcpt.as_ref(), &rcpt)?.clone();
        if let Some(reply) = &block.reject {
            return Err(reply.clone().into());
        }

        self.runner.check_rcpt(token, &block.checks, &rcpt).await?;

        let final_rcpt = {
            let state = self.rcpt_modifier_state(&block).await?;
            state.rewrite_rcpt(&rcpt).await?
        };
        if final_rcpt != rcpt_to {
            self.meta
                .original_rcpts
                .insert(final_rcpt.clone(), rcpt_to.to_owned());
        }

        for target in &block.targets {
            let index = match self
                .targets
                .iter()
                .position(|slot| same_target(&slot.target, target))
            {
                Some(index) => index,
                None => {
                    let delivery = target.start(&self.meta, &self.sender).await.map_err(
                        |error| {
                            tracing::error!(target = %target.name(), %error, "target start failed");
                            error
                        },
                    )?;
                    self.targets.push(TargetSlot {
                        target: target.clone(),
                        delivery,
                        recipients: Vec::new(),
                    });
                    self.targets.len() - 1
                }
            };
            let slot = &mut self.targets[index];
            slot.delivery.add_rcpt(&final_rcpt).await.map_err(|error| {
                tracing::error!(target = %slot.target.name(), %error, "target refused recipient");
                error
            })?;
            slot.recipients.push(rcpt_to.to_owned());
        }

        self.runner.record_rcpt(&rcpt);
        Ok(())
    }

    /// Checks, result stamping, enforcement and body rewrites shared by
    /// both body entry points.
    async fn run_body_preamble(
        &mut self,
        token: &CancellationToken,
        header: &mut Header,
        body: &std::sync::Arc<dyn Body>,
    ) -> Result<(), Error> {
        let source = self.source_block()?;

        self.runner.start_dmarc(header);
        self.runner
            .check_body(token, &self.cfg.checks, header, body)
            .await?;
        self.runner
            .check_body(token, &source.checks, header, body)
            .await?;
        self.runner
            .apply_results(token, &mut self.meta, header)
            .await?;

        self.global_modifiers
            .rewrite_body(header, body.as_ref())
            .await?;
        if let Some(scope) = self.source.as_mut() {
            scope.modifiers.rewrite_body(header, body.as_ref()).await?;
        }
        Ok(())
    }

    /// The per-block modifier state, created on first use. A fresh state is
    /// asked to rewrite the sender once; per-recipient modifiers cannot
    /// change it, so a differing answer is dropped with a warning.
    async fn rcpt_modifier_state(
        &mut self,
        block: &crate::config::RcptBlock,
    ) -> Result<&mut GroupState, Error> {
        if let Some(position) = self
            .rcpt_modifiers
            .iter()
            .position(|(id, _)| *id == block.id)
        {
            #[allow(clippy::indexing_slicing)]
            return Ok(&mut self.rcpt_modifiers[position].1);
        }

        let mut state = block.modifiers.new_state(&self.meta);
        let verdict = state.rewrite_sender(&self.sender).await;
        self.rcpt_modifiers.push((block.id, state));
        match verdict {
            Ok(rewritten) if rewritten != self.sender => {
                tracing::warn!(
                    "per-recipient modifiers changed the sender address; this is not supported and will be ignored"
                );
            }
            Ok(_) => {}
            Err(error) => return Err(error),
        }
        #[allow(clippy::expect_used)]
        Ok(&mut self
            .rcpt_modifiers
            .last_mut()
            .expect("pushed just above")
            .1)
    }

    fn source_block(&self) -> Result<std::sync::Arc<SourceBlock>, Error> {
        self.source
            .as_ref()
            .map(|scope| scope.block.clone())
            .ok_or_else(|| anyhow::anyhow!("the transaction has no resolved source block").into())
    }

    async fn close_states(&mut self) {
        if self.states_closed {
            return;
        }
        self.states_closed = true;
        self.runner.close().await;
        if let Err(error) = self.global_modifiers.close().await {
            tracing::warn!(%error, "global modifier close failed");
        }
        if let Some(scope) = self.source.as_mut() {
            if let Err(error) = scope.modifiers.close().await {
                tracing::warn!(%error, "source modifier close failed");
            }
        }
        for (_, state) in &mut self.rcpt_modifiers {
            if let Err(error) = state.close().await {
                tracing::warn!(%error, "recipient modifier close failed");
            }
        }
    }

    fn misuse(&self, operation: &str) -> Error {
        tracing::error!(state = ?self.state, operation, "operation on a finished transaction");
        anyhow::anyhow!("{operation} called on a transaction in state {:?}", self.state).into()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !matches!(self.state, TxState::Committed | TxState::Aborted) {
            tracing::warn!(id = %self.meta.id, state = ?self.state, "transaction dropped without commit or abort");
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.meta.id)
            .field("state", &self.state)
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}
