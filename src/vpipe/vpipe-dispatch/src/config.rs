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

//! The routing configuration tree.
//!
//! Built once by the embedding application from its resolved configuration,
//! validated here, then frozen behind an `Arc` and served to every
//! transaction. Match keys are stored lower-cased; an empty key is the
//! SMTP null reverse-path.

use anyhow::Context;
use vpipe_check::RegisteredCheck;
use vpipe_common::{address, DeliveryTarget, EnhancedCode, Reply};
use vpipe_modify::Group;

static NEXT_BLOCK_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn next_block_id() -> usize {
    NEXT_BLOCK_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Scope matched against a single recipient: either a list of delivery
/// targets or a rejection, never both.
pub struct RcptBlock {
    pub(crate) id: usize,
    pub(crate) checks: Vec<RegisteredCheck>,
    pub(crate) modifiers: Group,
    pub(crate) targets: Vec<std::sync::Arc<dyn DeliveryTarget>>,
    pub(crate) reject: Option<Reply>,
}

impl RcptBlock {
    /// A block delivering to `targets`.
    ///
    /// # Errors
    ///
    /// * `targets` is empty.
    pub fn deliver_to(
        checks: Vec<RegisteredCheck>,
        modifiers: Group,
        targets: Vec<std::sync::Arc<dyn DeliveryTarget>>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !targets.is_empty(),
            "a recipient block needs at least one delivery target or a reject directive"
        );
        Ok(Self {
            id: next_block_id(),
            checks,
            modifiers,
            targets,
            reject: None,
        })
    }

    /// A block rejecting every recipient it matches.
    #[must_use]
    pub fn reject(reply: Reply) -> Self {
        Self {
            id: next_block_id(),
            checks: Vec::new(),
            modifiers: Group::empty(),
            targets: Vec::new(),
            reject: Some(reply),
        }
    }
}

impl std::fmt::Debug for RcptBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcptBlock")
            .field("id", &self.id)
            .field("targets", &self.targets.len())
            .field("reject", &self.reject)
            .finish_non_exhaustive()
    }
}

/// Scope matched against the sender, holding the per-recipient routing.
pub struct SourceBlock {
    pub(crate) checks: Vec<RegisteredCheck>,
    pub(crate) modifiers: Group,
    pub(crate) reject: Option<Reply>,
    pub(crate) rcpts: std::collections::HashMap<String, std::sync::Arc<RcptBlock>>,
    pub(crate) default_rcpt: Option<std::sync::Arc<RcptBlock>>,
}

impl SourceBlock {
    /// A block routing its recipients through `rcpts` with an optional
    /// fallback.
    ///
    /// # Errors
    ///
    /// * neither a recipient map entry nor a default block is given.
    /// * a match key is not an address or a domain.
    pub fn new(
        checks: Vec<RegisteredCheck>,
        modifiers: Group,
        rcpts: Vec<(String, std::sync::Arc<RcptBlock>)>,
        default_rcpt: Option<std::sync::Arc<RcptBlock>>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !rcpts.is_empty() || default_rcpt.is_some(),
            "a source block needs recipient routing or a default recipient block"
        );
        Ok(Self {
            checks,
            modifiers,
            reject: None,
            rcpts: normalized_map(rcpts).context("invalid recipient match key")?,
            default_rcpt,
        })
    }

    /// A block rejecting every sender it matches.
    #[must_use]
    pub fn reject(reply: Reply) -> Self {
        Self {
            checks: Vec::new(),
            modifiers: Group::empty(),
            reject: Some(reply),
            rcpts: std::collections::HashMap::new(),
            default_rcpt: None,
        }
    }
}

impl std::fmt::Debug for SourceBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBlock")
            .field("rcpts", &self.rcpts.keys().collect::<Vec<_>>())
            .field("reject", &self.reject)
            .finish_non_exhaustive()
    }
}

/// The frozen routing tree a [`crate::Pipeline`] serves.
pub struct RoutingConfig {
    pub(crate) checks: Vec<RegisteredCheck>,
    pub(crate) modifiers: Group,
    pub(crate) sources: std::collections::HashMap<String, std::sync::Arc<SourceBlock>>,
    pub(crate) default_source: Option<std::sync::Arc<SourceBlock>>,
    pub(crate) reject_score: Option<i32>,
    pub(crate) quarantine_score: Option<i32>,
    pub(crate) dmarc: bool,
}

impl RoutingConfig {
    ///
    #[must_use]
    pub fn builder() -> RoutingConfigBuilder {
        RoutingConfigBuilder::default()
    }
}

impl std::fmt::Debug for RoutingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingConfig")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("dmarc", &self.dmarc)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RoutingConfig`]; validation happens in
/// [`RoutingConfigBuilder::build`].
#[derive(Default)]
pub struct RoutingConfigBuilder {
    checks: Vec<RegisteredCheck>,
    modifiers: Group,
    sources: Vec<(String, std::sync::Arc<SourceBlock>)>,
    default_source: Option<std::sync::Arc<SourceBlock>>,
    reject_score: Option<i32>,
    quarantine_score: Option<i32>,
    dmarc: bool,
}

impl RoutingConfigBuilder {
    /// Checks run for every message, before any block is resolved.
    #[must_use]
    pub fn with_checks(mut self, checks: Vec<RegisteredCheck>) -> Self {
        self.checks = checks;
        self
    }

    /// Modifiers applied to every message.
    #[must_use]
    pub fn with_modifiers(mut self, modifiers: Group) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Route senders matching `key` (an address, a domain, `postmaster`
    /// or the empty null reverse-path) to `block`.
    #[must_use]
    pub fn with_source(
        mut self,
        key: impl Into<String>,
        block: std::sync::Arc<SourceBlock>,
    ) -> Self {
        self.sources.push((key.into(), block));
        self
    }

    /// Block for senders no key matches.
    #[must_use]
    pub fn with_default_source(mut self, block: std::sync::Arc<SourceBlock>) -> Self {
        self.default_source = Some(block);
        self
    }

    /// Reject the message when the merged check score reaches `score`.
    #[must_use]
    pub const fn with_reject_score(mut self, score: i32) -> Self {
        self.reject_score = Some(score);
        self
    }

    /// Quarantine the message when the merged check score reaches `score`.
    #[must_use]
    pub const fn with_quarantine_score(mut self, score: i32) -> Self {
        self.quarantine_score = Some(score);
        self
    }

    /// Enforce DMARC on the From header after the body checks.
    #[must_use]
    pub const fn with_dmarc(mut self) -> Self {
        self.dmarc = true;
        self
    }

    /// Validate and freeze the tree.
    ///
    /// # Errors
    ///
    /// * no source routing at all.
    /// * a match key is not an address or a domain.
    pub fn build(self) -> anyhow::Result<std::sync::Arc<RoutingConfig>> {
        anyhow::ensure!(
            !self.sources.is_empty() || self.default_source.is_some(),
            "the routing configuration needs source routing or a default source block"
        );
        Ok(std::sync::Arc::new(RoutingConfig {
            checks: self.checks,
            modifiers: self.modifiers,
            sources: normalized_map(self.sources).context("invalid source match key")?,
            default_source: self.default_source,
            reject_score: self.reject_score,
            quarantine_score: self.quarantine_score,
            dmarc: self.dmarc,
        }))
    }
}

/// Lower-case and validate match keys, rejecting duplicates.
fn normalized_map<B>(
    entries: Vec<(String, std::sync::Arc<B>)>,
) -> anyhow::Result<std::collections::HashMap<String, std::sync::Arc<B>>> {
    let mut map = std::collections::HashMap::with_capacity(entries.len());
    for (key, block) in entries {
        let key = key.to_lowercase();
        anyhow::ensure!(
            key.is_empty() || address::valid(&key) || address::valid_domain(&key),
            "'{key}' is neither an address nor a domain"
        );
        anyhow::ensure!(
            map.insert(key.clone(), block).is_none(),
            "'{key}' is routed twice"
        );
    }
    Ok(map)
}

/// Parse the arguments of a `reject [CODE [ENHCODE [MESSAGE]]]` directive.
///
/// Defaults are `554 5.7.0 Message rejected due to a local policy`. The
/// code and the enhanced-code class must be 4 or 5; a reply directive
/// cannot express success.
///
/// # Errors
///
/// * the code or enhanced code does not parse or is out of range.
pub fn reject_directive(args: &[&str]) -> anyhow::Result<Reply> {
    let Some((code, rest)) = args.split_first() else {
        return Ok(Reply::policy_reject());
    };
    let code = code
        .parse::<u16>()
        .with_context(|| format!("'{code}' is not an smtp status code"))?;
    anyhow::ensure!(
        matches!(code / 100, 4 | 5),
        "reject code must start with 4 or 5, got {code}"
    );

    let Some((enhanced, message)) = rest.split_first() else {
        return Ok(Reply::new(code, EnhancedCode(5, 7, 0), "Message rejected due to a local policy"));
    };
    let enhanced = enhanced.parse::<EnhancedCode>()?;
    anyhow::ensure!(
        matches!(enhanced.class(), 4 | 5),
        "enhanced code class must be 4 or 5, got {enhanced}"
    );

    let message = if message.is_empty() {
        "Message rejected due to a local policy".to_owned()
    } else {
        message.join(" ")
    };
    Ok(Reply::new(code, enhanced, message))
}
