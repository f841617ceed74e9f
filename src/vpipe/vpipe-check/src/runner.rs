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

use crate::{dmarc::DmarcEnforcer, CheckResult, CheckState, RegisteredCheck};
use futures_util::FutureExt;
use vpipe_auth::dmarc::TxtResolver;
use vpipe_common::{
    sync::{AtomicFlag, CancellationToken},
    Body, Error, Header, HeaderField, MsgMetadata, Reply,
};

/// Score thresholds enforced after the body checks ran.
#[derive(Debug, Clone, Copy, Default)]
pub struct Thresholds {
    /// Reject the message when the merged score reaches this value.
    pub reject_score: Option<i32>,
    /// Quarantine the message when the merged score reaches this value.
    pub quarantine_score: Option<i32>,
}

/// Merge target shared by the concurrently running check tasks.
///
/// Auth results and header additions are guarded by two independent locks
/// so tasks finishing simultaneously do not serialize on a single one; the
/// quarantine flag and the score are atomics. The first reject wins, the
/// rest are dropped.
#[derive(Default)]
struct Merged {
    auth_results: std::sync::Mutex<Vec<vpipe_auth::AuthResult>>,
    headers: std::sync::Mutex<Vec<HeaderField>>,
    quarantine: AtomicFlag,
    score: std::sync::atomic::AtomicI32,
    reject: std::sync::Mutex<Option<Error>>,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Merged {
    /// Fold `result` in. Returns `true` when it carried the first reject
    /// of the transaction, in which case the caller cancels the phase
    /// scope.
    fn absorb(&self, result: CheckResult) -> bool {
        if !result.auth_results.is_empty() {
            lock(&self.auth_results).extend(result.auth_results);
        }
        if !result.headers.is_empty() {
            lock(&self.headers).extend(result.headers);
        }
        if result.quarantine {
            self.quarantine.set();
        }
        if result.score_adjust != 0 {
            self.score
                .fetch_add(result.score_adjust, std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(reject) = result.reject {
            let mut slot = lock(&self.reject);
            if slot.is_none() {
                *slot = Some(reject);
                return true;
            }
        }
        false
    }

    fn take_reject(&self) -> Option<Error> {
        lock(&self.reject).take()
    }

    fn score(&self) -> i32 {
        self.score.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// One phase invocation, owned by the spawned task.
#[derive(Clone)]
enum PhaseCall {
    Connection,
    Sender(String),
    Rcpt(String),
    Body(Header, std::sync::Arc<dyn Body>),
}

struct Slot {
    name: String,
    state: Option<Box<dyn CheckState>>,
    conn_done: bool,
    sender_done: bool,
    rcpts_done: usize,
    closed: bool,
}

/// Per-message check executor.
///
/// Owns one state object per check, lazily created at first use: a check
/// attached to a recipient block that only appears at the third `RCPT TO`
/// still observes the connection, the sender and the two earlier
/// recipients, replayed in order before its first live phase.
pub struct CheckRunner {
    meta: MsgMetadata,
    thresholds: Thresholds,
    dmarc: Option<DmarcEnforcer>,
    states: std::collections::HashMap<usize, Slot>,
    conn_seen: bool,
    sender: Option<String>,
    rcpts: Vec<String>,
    merged: std::sync::Arc<Merged>,
}

impl CheckRunner {
    /// Runner for one transaction. `dmarc_resolver` enables DMARC
    /// enforcement when present.
    #[must_use]
    pub fn new(
        meta: &MsgMetadata,
        thresholds: Thresholds,
        dmarc_resolver: Option<std::sync::Arc<dyn TxtResolver>>,
    ) -> Self {
        Self {
            meta: meta.clone(),
            thresholds,
            dmarc: dmarc_resolver.map(DmarcEnforcer::new),
            states: std::collections::HashMap::new(),
            conn_seen: false,
            sender: None,
            rcpts: Vec::new(),
            merged: std::sync::Arc::new(Merged::default()),
        }
    }

    /// Run the connection phase for every check in `checks` that has not
    /// observed it yet.
    ///
    /// # Errors
    ///
    /// * a check rejected the transaction.
    pub async fn check_connection(
        &mut self,
        token: &CancellationToken,
        checks: &[RegisteredCheck],
    ) -> Result<(), Error> {
        self.ensure_states(checks);
        let pending = self.pending(checks, |slot| !slot.conn_done);
        let outcome = self.run_phase(token, &pending, &PhaseCall::Connection).await;
        self.conn_seen = true;
        outcome
    }

    /// Run the sender phase for every check in `checks` that has not
    /// observed a sender yet. The address recorded for later replay is the
    /// one given here, i.e. the most recent rewrite.
    ///
    /// # Errors
    ///
    /// * a check rejected the sender.
    pub async fn check_sender(
        &mut self,
        token: &CancellationToken,
        checks: &[RegisteredCheck],
        mail_from: &str,
    ) -> Result<(), Error> {
        self.ensure_states(checks);
        self.replay(token, checks, Through::Connection).await?;
        let pending = self.pending(checks, |slot| !slot.sender_done);
        let outcome = self
            .run_phase(token, &pending, &PhaseCall::Sender(mail_from.to_owned()))
            .await;
        self.sender = Some(mail_from.to_owned());
        outcome
    }

    /// Run the recipient phase of every check in `checks` for `rcpt_to`,
    /// replaying earlier phases into late-created states first.
    ///
    /// # Errors
    ///
    /// * a check rejected the recipient.
    pub async fn check_rcpt(
        &mut self,
        token: &CancellationToken,
        checks: &[RegisteredCheck],
        rcpt_to: &str,
    ) -> Result<(), Error> {
        self.ensure_states(checks);
        self.replay(token, checks, Through::Rcpts).await?;
        let all = checks.iter().map(RegisteredCheck::id).collect::<Vec<_>>();
        let outcome = self
            .run_phase(token, &all, &PhaseCall::Rcpt(rcpt_to.to_owned()))
            .await;
        // the current recipient is recorded separately (`record_rcpt`) once
        // the whole add_rcpt step went through; states that just ran it are
        // marked ahead so replay does not repeat it.
        let ahead = self.rcpts.len() + 1;
        for id in &all {
            if let Some(slot) = self.states.get_mut(id) {
                slot.rcpts_done = ahead;
            }
        }
        outcome
    }

    /// Record an accepted recipient for replay into late-created states.
    pub fn record_rcpt(&mut self, rcpt_to: &str) {
        self.rcpts.push(rcpt_to.to_owned());
    }

    /// Run the body phase of every check in `checks`.
    ///
    /// # Errors
    ///
    /// * a check rejected the message.
    pub async fn check_body(
        &mut self,
        token: &CancellationToken,
        checks: &[RegisteredCheck],
        header: &Header,
        body: &std::sync::Arc<dyn Body>,
    ) -> Result<(), Error> {
        self.ensure_states(checks);
        self.replay(token, checks, Through::Rcpts).await?;
        let all = checks.iter().map(RegisteredCheck::id).collect::<Vec<_>>();
        self.run_phase(token, &all, &PhaseCall::Body(header.clone(), body.clone()))
            .await
    }

    /// Begin the DMARC policy lookup for the From domain of `header`,
    /// concurrently with the body checks. No-op when DMARC is disabled or
    /// the lookup already started.
    pub fn start_dmarc(&mut self, header: &Header) {
        if let Some(dmarc) = &mut self.dmarc {
            dmarc.start(header);
        }
    }

    /// Stamp the accumulated results on `header` and enforce DMARC and
    /// scoring.
    ///
    /// The combined `Authentication-Results` field goes on top of the
    /// header, followed by the additions queued by checks in the order they
    /// produced them.
    ///
    /// # Errors
    ///
    /// * DMARC evaluation failed with a reject policy (`550 5.7.1`).
    /// * the merged score crossed the reject threshold (`550 5.7.0`).
    pub async fn apply_results(
        &mut self,
        token: &CancellationToken,
        meta: &mut MsgMetadata,
        header: &mut Header,
    ) -> Result<(), Error> {
        if self.merged.quarantine.is_set() {
            meta.quarantine = true;
        }

        let mut auth_results = lock(&self.merged.auth_results).clone();
        let enforcement = match &self.dmarc {
            Some(dmarc) => {
                let (result, enforcement) = dmarc.enforce(token, &auth_results).await;
                if let Some(result) = result {
                    auth_results.push(vpipe_auth::AuthResult::Dmarc(result));
                }
                enforcement
            }
            None => crate::dmarc::Enforcement::Accept,
        };

        let mut stamped = vec![HeaderField::new(
            "Authentication-Results",
            vpipe_auth::format_header(&meta.our_hostname, &auth_results),
        )];
        stamped.extend(lock(&self.merged.headers).drain(..));
        for field in stamped.into_iter().rev() {
            header.prepend(field);
        }

        match enforcement {
            crate::dmarc::Enforcement::Reject => {
                return Err(Reply::dmarc_failed().into());
            }
            crate::dmarc::Enforcement::Quarantine => meta.quarantine = true,
            crate::dmarc::Enforcement::Accept => {}
        }

        let score = self.merged.score();
        if let Some(threshold) = self.thresholds.reject_score {
            if score >= threshold {
                return Err(Reply::score_reject(score).into());
            }
        }
        if let Some(threshold) = self.thresholds.quarantine_score {
            if score >= threshold {
                meta.quarantine = true;
            }
        }
        Ok(())
    }

    /// Close every remaining check state, logging failures.
    pub async fn close(&mut self) {
        for slot in self.states.values_mut() {
            if slot.closed {
                continue;
            }
            slot.closed = true;
            if let Some(state) = slot.state.as_mut() {
                if let Err(error) = state.close().await {
                    tracing::warn!(check = %slot.name, %error, "check state close failed");
                }
            }
        }
    }

    fn ensure_states(&mut self, checks: &[RegisteredCheck]) {
        for check in checks {
            if !self.states.contains_key(&check.id()) {
                self.states.insert(
                    check.id(),
                    Slot {
                        name: check.check().name().to_owned(),
                        state: Some(check.check().new_state(&self.meta)),
                        conn_done: false,
                        sender_done: false,
                        rcpts_done: 0,
                        closed: false,
                    },
                );
            }
        }
    }

    fn pending(
        &self,
        checks: &[RegisteredCheck],
        filter: impl Fn(&Slot) -> bool,
    ) -> Vec<usize> {
        checks
            .iter()
            .map(RegisteredCheck::id)
            .filter(|id| self.states.get(id).map_or(false, &filter))
            .collect()
    }

    /// Replay phases already seen by the transaction into states created
    /// after the fact: connection and sender first (serial across phases,
    /// parallel across checks), then each accepted recipient in order.
    async fn replay(
        &mut self,
        token: &CancellationToken,
        checks: &[RegisteredCheck],
        through: Through,
    ) -> Result<(), Error> {
        if self.conn_seen {
            let lagging = self.pending(checks, |slot| !slot.conn_done);
            self.run_phase(token, &lagging, &PhaseCall::Connection)
                .await?;
        }
        if through == Through::Connection {
            return Ok(());
        }
        if let Some(sender) = self.sender.clone() {
            let lagging = self.pending(checks, |slot| !slot.sender_done);
            self.run_phase(token, &lagging, &PhaseCall::Sender(sender))
                .await?;
        }
        for index in 0..self.rcpts.len() {
            let rcpt = self.rcpts[index].clone();
            let lagging = self.pending(checks, |slot| slot.rcpts_done == index);
            self.run_phase(token, &lagging, &PhaseCall::Rcpt(rcpt))
                .await?;
        }
        Ok(())
    }

    /// Execute one phase as a group of independent tasks under a child
    /// cancellation scope. The group always waits for every task; the
    /// returned error is the first reject observed, arbitrary among
    /// simultaneous ones. Results of the cancelled rest still merge.
    async fn run_phase(
        &mut self,
        token: &CancellationToken,
        ids: &[usize],
        call: &PhaseCall,
    ) -> Result<(), Error> {
        if !ids.is_empty() {
            let scope = token.child_token();
            let mut group = tokio::task::JoinSet::new();
            for id in ids.iter().copied() {
                let Some(slot) = self.states.get_mut(&id) else {
                    continue;
                };
                let Some(mut state) = slot.state.take() else {
                    continue;
                };
                let scope = scope.clone();
                let merged = self.merged.clone();
                let call = call.clone();
                let name = slot.name.clone();
                group.spawn(async move {
                    let result = std::panic::AssertUnwindSafe(async {
                        match &call {
                            PhaseCall::Connection => state.check_connection(&scope).await,
                            PhaseCall::Sender(mail_from) => {
                                state.check_sender(&scope, mail_from).await
                            }
                            PhaseCall::Rcpt(rcpt_to) => state.check_rcpt(&scope, rcpt_to).await,
                            PhaseCall::Body(header, body) => {
                                state.check_body(&scope, header, body.as_ref()).await
                            }
                        }
                    })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!(check = %name, "check panicked, failing the phase");
                        CheckResult::reject(Reply::internal_temporary())
                    });
                    if merged.absorb(result) {
                        scope.cancel();
                    }
                    (id, state)
                });
            }
            while let Some(joined) = group.join_next().await {
                match joined {
                    Ok((id, state)) => {
                        if let Some(slot) = self.states.get_mut(&id) {
                            slot.state = Some(state);
                            match call {
                                PhaseCall::Connection => slot.conn_done = true,
                                PhaseCall::Sender(_) => slot.sender_done = true,
                                PhaseCall::Rcpt(_) => slot.rcpts_done += 1,
                                PhaseCall::Body(..) => {}
                            }
                        }
                    }
                    Err(error) => {
                        // the state is gone with the task; close will skip it.
                        tracing::error!(%error, "check task aborted");
                        self.merged
                            .absorb(CheckResult::reject(Reply::internal_temporary()));
                    }
                }
            }
        }
        if let Some(reject) = self.merged.take_reject() {
            return Err(reject);
        }
        if token.is_cancelled() {
            return Err(Reply::transaction_cancelled().into());
        }
        Ok(())
    }
}

/// How far [`CheckRunner::replay`] goes before the live phase runs.
#[derive(PartialEq, Eq, Clone, Copy)]
enum Through {
    Connection,
    Rcpts,
}

impl std::fmt::Debug for CheckRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckRunner")
            .field("states", &self.states.len())
            .field("rcpts", &self.rcpts.len())
            .finish_non_exhaustive()
    }
}
