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

//! Ready-made routing configurations and metadata for tests.

use vpipe_common::{DeliveryTarget, MsgMetadata, Protocol};
use vpipe_dispatch::{RcptBlock, RoutingConfig, SourceBlock};
use vpipe_modify::Group;

/// Metadata the way a local test listener would build it.
pub fn local_meta(mail_from: &str) -> MsgMetadata {
    let mut meta = MsgMetadata::new(Protocol::Esmtp, "testserver.com", mail_from);
    meta.src_hostname = Some("client.testserver.com".to_owned());
    meta
}

/// Any sender, any recipient, one target.
pub fn single_target(target: std::sync::Arc<dyn DeliveryTarget>) -> std::sync::Arc<RoutingConfig> {
    single_target_with(Group::empty(), Group::empty(), target)
}

/// Any sender, any recipient, one target; `global` modifiers on the root
/// and `rcpt` modifiers on the default recipient block.
pub fn single_target_with(
    global: Group,
    rcpt: Group,
    target: std::sync::Arc<dyn DeliveryTarget>,
) -> std::sync::Arc<RoutingConfig> {
    let block =
        std::sync::Arc::new(RcptBlock::deliver_to(Vec::new(), rcpt, vec![target]).unwrap());
    let source = std::sync::Arc::new(
        SourceBlock::new(Vec::new(), Group::empty(), Vec::new(), Some(block)).unwrap(),
    );
    RoutingConfig::builder()
        .with_modifiers(global)
        .with_default_source(source)
        .build()
        .unwrap()
}

/// A source block delivering every recipient to `target`.
pub fn source_to(target: std::sync::Arc<dyn DeliveryTarget>) -> std::sync::Arc<SourceBlock> {
    let block = std::sync::Arc::new(
        RcptBlock::deliver_to(Vec::new(), Group::empty(), vec![target]).unwrap(),
    );
    std::sync::Arc::new(
        SourceBlock::new(Vec::new(), Group::empty(), Vec::new(), Some(block)).unwrap(),
    )
}
