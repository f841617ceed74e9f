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

//! Mock collaborators for pipeline tests.

use vpipe_auth::{
    dmarc::{LookupError, TxtResolver},
    AuthResult,
};
use vpipe_check::{Check, CheckResult, CheckState};
use vpipe_common::{
    sync::CancellationToken, Body, ConnectionState, DeliveryTarget, Error, Header, HeaderField,
    MsgMetadata, Reply, StatusCollector, TargetDelivery,
};
use vpipe_modify::{Modifier, ModifierState};

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// What a [`MockCheck`] reports for one phase.
#[derive(Debug, Clone, Default)]
pub struct MockVerdict {
    pub reject: Option<Reply>,
    pub quarantine: bool,
    pub score_adjust: i32,
    pub auth_results: Vec<AuthResult>,
    pub headers: Vec<HeaderField>,
}

impl MockVerdict {
    fn to_result(&self) -> CheckResult {
        CheckResult {
            reject: self.reject.clone().map(Error::from),
            quarantine: self.quarantine,
            score_adjust: self.score_adjust,
            auth_results: self.auth_results.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// A check with a fixed verdict per phase.
#[derive(Debug, Clone, Default)]
pub struct MockCheck {
    pub name: String,
    pub early_reject: Option<Reply>,
    pub connection: MockVerdict,
    pub sender: MockVerdict,
    pub rcpt: MockVerdict,
    pub body: MockVerdict,
}

impl MockCheck {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// A check whose body phase attaches `auth_results`.
    pub fn stamping(name: &str, auth_results: Vec<AuthResult>) -> Self {
        let mut check = Self::named(name);
        check.body.auth_results = auth_results;
        check
    }

    /// A check whose body phase adjusts the score.
    pub fn scoring(name: &str, score_adjust: i32) -> Self {
        let mut check = Self::named(name);
        check.body.score_adjust = score_adjust;
        check
    }
}

#[async_trait::async_trait]
impl Check for MockCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_early(&self) -> bool {
        self.early_reject.is_some()
    }

    async fn check_early(&self, _state: &ConnectionState) -> Result<(), Error> {
        self.early_reject
            .clone()
            .map_or(Ok(()), |reply| Err(reply.into()))
    }

    fn new_state(&self, _meta: &MsgMetadata) -> Box<dyn CheckState> {
        Box::new(self.clone())
    }
}

#[async_trait::async_trait]
impl CheckState for MockCheck {
    async fn check_connection(&mut self, _token: &CancellationToken) -> CheckResult {
        self.connection.to_result()
    }

    async fn check_sender(&mut self, _token: &CancellationToken, _mail_from: &str) -> CheckResult {
        self.sender.to_result()
    }

    async fn check_rcpt(&mut self, _token: &CancellationToken, _rcpt_to: &str) -> CheckResult {
        self.rcpt.to_result()
    }

    async fn check_body(
        &mut self,
        _token: &CancellationToken,
        _header: &Header,
        _body: &dyn Body,
    ) -> CheckResult {
        self.body.to_result()
    }
}

/// A modifier rewriting senders and recipients through fixed maps.
#[derive(Debug, Clone, Default)]
pub struct MockModifier {
    pub name: String,
    pub sender_map: std::collections::HashMap<String, String>,
    pub rcpt_map: std::collections::HashMap<String, String>,
    /// Stamped on the header during the body rewrite, when set.
    pub header_stamp: Option<HeaderField>,
}

impl MockModifier {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    pub fn rewriting_rcpt(name: &str, from: &str, to: &str) -> Self {
        let mut modifier = Self::named(name);
        modifier.rcpt_map.insert(from.to_owned(), to.to_owned());
        modifier
    }
}

#[async_trait::async_trait]
impl Modifier for MockModifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_state(&self, _meta: &MsgMetadata) -> Box<dyn ModifierState> {
        Box::new(self.clone())
    }
}

#[async_trait::async_trait]
impl ModifierState for MockModifier {
    async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String, Error> {
        Ok(self
            .sender_map
            .get(mail_from)
            .cloned()
            .unwrap_or_else(|| mail_from.to_owned()))
    }

    async fn rewrite_rcpt(&mut self, rcpt_to: &str) -> Result<String, Error> {
        Ok(self
            .rcpt_map
            .get(rcpt_to)
            .cloned()
            .unwrap_or_else(|| rcpt_to.to_owned()))
    }

    async fn rewrite_body(&mut self, header: &mut Header, _body: &dyn Body) -> Result<(), Error> {
        if let Some(stamp) = &self.header_stamp {
            header.add_field(stamp.clone());
        }
        Ok(())
    }
}

/// A message a [`MockTarget`] committed.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub delivery_id: String,
    pub sender: String,
    /// Recipients exactly as the target received them (after rewrites).
    pub recipients: Vec<String>,
    pub header: Header,
    pub body: Vec<u8>,
}

/// In-memory delivery target with configurable failures.
#[derive(Default)]
pub struct MockTarget {
    committed: std::sync::Arc<std::sync::Mutex<Vec<DeliveredMessage>>>,
    pub start_reject: Option<Reply>,
    /// Reject these final recipient addresses at `add_rcpt`.
    pub rcpt_rejects: std::collections::HashMap<String, Reply>,
    pub body_reject: Option<Reply>,
    pub commit_reject: Option<Reply>,
    /// Advertise per-recipient status support.
    pub partial: bool,
    /// Per-recipient failures reported in non-atomic mode (keyed by the
    /// final address).
    pub partial_rcpt_errors: std::collections::HashMap<String, Reply>,
}

impl MockTarget {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// A target failing every atomic body delivery with `reply`.
    pub fn rejecting_body(reply: Reply) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            body_reject: Some(reply),
            ..Self::default()
        })
    }

    /// A target advertising partial delivery, failing `rcpts`.
    pub fn partial_failing(rcpts: &[(&str, Reply)]) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            partial: true,
            partial_rcpt_errors: rcpts
                .iter()
                .map(|(rcpt, reply)| ((*rcpt).to_owned(), reply.clone()))
                .collect(),
            ..Self::default()
        })
    }

    /// Messages committed so far.
    pub fn committed(&self) -> Vec<DeliveredMessage> {
        lock(&self.committed).clone()
    }
}

impl std::fmt::Debug for MockTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTarget")
            .field("committed", &lock(&self.committed).len())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl DeliveryTarget for MockTarget {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(
        &self,
        meta: &MsgMetadata,
        mail_from: &str,
    ) -> Result<Box<dyn TargetDelivery>, Error> {
        if let Some(reply) = &self.start_reject {
            return Err(reply.clone().into());
        }
        Ok(Box::new(MockTargetDelivery {
            committed: self.committed.clone(),
            rcpt_rejects: self.rcpt_rejects.clone(),
            body_reject: self.body_reject.clone(),
            commit_reject: self.commit_reject.clone(),
            partial: self.partial,
            partial_rcpt_errors: self.partial_rcpt_errors.clone(),
            message: DeliveredMessage {
                delivery_id: meta.id.clone(),
                sender: mail_from.to_owned(),
                recipients: Vec::new(),
                header: Header::new(),
                body: Vec::new(),
            },
        }))
    }
}

struct MockTargetDelivery {
    committed: std::sync::Arc<std::sync::Mutex<Vec<DeliveredMessage>>>,
    rcpt_rejects: std::collections::HashMap<String, Reply>,
    body_reject: Option<Reply>,
    commit_reject: Option<Reply>,
    partial: bool,
    partial_rcpt_errors: std::collections::HashMap<String, Reply>,
    message: DeliveredMessage,
}

#[async_trait::async_trait]
impl TargetDelivery for MockTargetDelivery {
    async fn add_rcpt(&mut self, rcpt_to: &str) -> Result<(), Error> {
        if let Some(reply) = self.rcpt_rejects.get(rcpt_to) {
            return Err(reply.clone().into());
        }
        self.message.recipients.push(rcpt_to.to_owned());
        Ok(())
    }

    async fn body(&mut self, header: &Header, body: &dyn Body) -> Result<(), Error> {
        if let Some(reply) = &self.body_reject {
            return Err(reply.clone().into());
        }
        self.record(header, body)?;
        Ok(())
    }

    fn supports_partial(&self) -> bool {
        self.partial
    }

    async fn body_non_atomic(
        &mut self,
        sink: &mut dyn StatusCollector,
        header: &Header,
        body: &dyn Body,
    ) {
        if let Err(error) = self.record(header, body) {
            let reply = error.to_reply();
            for rcpt in &self.message.recipients {
                sink.set_status(rcpt, Err(reply.clone()));
            }
            return;
        }
        for rcpt in self.message.recipients.clone() {
            let status = self
                .partial_rcpt_errors
                .get(&rcpt)
                .map_or(Ok(()), |reply| Err(reply.clone()));
            sink.set_status(&rcpt, status);
        }
    }

    async fn commit(&mut self) -> Result<(), Error> {
        if let Some(reply) = &self.commit_reject {
            return Err(reply.clone().into());
        }
        lock(&self.committed).push(self.message.clone());
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl MockTargetDelivery {
    fn record(&mut self, header: &Header, body: &dyn Body) -> Result<(), Error> {
        self.message.header = header.clone();
        self.message.body.clear();
        std::io::Read::read_to_end(
            &mut body.open().map_err(anyhow::Error::from)?,
            &mut self.message.body,
        )
        .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

/// [`StatusCollector`] recording every status it receives, in call order.
#[derive(Debug, Clone, Default)]
pub struct StatusRecorder {
    statuses: std::sync::Arc<std::sync::Mutex<Vec<(String, Result<(), Reply>)>>>,
}

impl StatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<(String, Result<(), Reply>)> {
        lock(&self.statuses).clone()
    }
}

impl StatusCollector for StatusRecorder {
    fn set_status(&mut self, rcpt_to: &str, status: Result<(), Reply>) {
        lock(&self.statuses).push((rcpt_to.to_owned(), status));
    }
}

/// [`TxtResolver`] over a static zone, with an optional forced failure.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    pub zone: std::collections::HashMap<String, Vec<String>>,
    pub fail: Option<LookupError>,
}

impl StaticResolver {
    /// A zone publishing one DMARC record for `domain`.
    pub fn dmarc(domain: &str, record: &str) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            zone: [(format!("_dmarc.{domain}"), vec![record.to_owned()])]
                .into_iter()
                .collect(),
            fail: None,
        })
    }

    /// A resolver failing every lookup.
    pub fn failing(error: LookupError) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            zone: std::collections::HashMap::new(),
            fail: Some(error),
        })
    }
}

#[async_trait::async_trait]
impl TxtResolver for StaticResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, LookupError> {
        if let Some(error) = &self.fail {
            return Err(error.clone());
        }
        self.zone.get(name).cloned().ok_or(LookupError::NotFound)
    }
}
