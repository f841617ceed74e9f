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

use crate::config::{local_meta, single_target_with};
use crate::mock::MockTarget;
use pretty_assertions::assert_eq;
use vpipe_common::{sync::CancellationToken, Header, MemoryBody};
use vpipe_dispatch::Pipeline;
use vpipe_modify::{AliasFile, Group};

async fn alias_group(content: &str) -> (tempfile::TempDir, Group) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aliases");
    tokio::fs::write(&path, content).await.unwrap();
    let aliases = AliasFile::new(vec![path]).await.unwrap();
    (dir, Group::new(vec![std::sync::Arc::new(aliases)]))
}

async fn deliver_one(pipeline: &Pipeline, rcpt: &str) -> vpipe_dispatch::Delivery {
    let token = CancellationToken::new();
    let mut delivery = pipeline
        .start(&token, local_meta("sender@example.com"), "sender@example.com")
        .await
        .unwrap();
    delivery.add_rcpt(&token, rcpt).await.unwrap();
    delivery
        .body(
            &token,
            Header::new(),
            std::sync::Arc::new(MemoryBody::from("body")),
        )
        .await
        .unwrap();
    delivery.commit().await.unwrap();
    delivery
}

#[test_log::test(tokio::test)]
async fn local_part_expansion_records_the_original_recipient() {
    let (_dir, aliases) = alias_group("test: test2\n").await;
    let target = MockTarget::new();
    let pipeline =
        Pipeline::new(single_target_with(aliases, Group::empty(), target.clone())).unwrap();

    let delivery = deliver_one(&pipeline, "test@example.com").await;

    let committed = target.committed();
    assert_eq!(committed[0].recipients, vec!["test2@example.com"]);
    assert_eq!(
        delivery.metadata().original_rcpts.get("test2@example.com"),
        Some(&"test@example.com".to_owned())
    );
}

#[test_log::test(tokio::test)]
async fn full_address_aliases_replace_the_whole_address() {
    let (_dir, aliases) = alias_group("test@example.com: test@example.org\n").await;
    let target = MockTarget::new();
    let pipeline =
        Pipeline::new(single_target_with(aliases, Group::empty(), target.clone())).unwrap();

    let delivery = deliver_one(&pipeline, "test@example.com").await;

    assert_eq!(target.committed()[0].recipients, vec!["test@example.org"]);
    assert_eq!(
        delivery.metadata().original_rcpts.get("test@example.org"),
        Some(&"test@example.com".to_owned())
    );
}

#[test_log::test(tokio::test)]
async fn postmaster_alias_with_a_complete_replacement() {
    let (_dir, aliases) = alias_group("postmaster: admin@example.org\n").await;
    let target = MockTarget::new();
    let pipeline =
        Pipeline::new(single_target_with(aliases, Group::empty(), target.clone())).unwrap();

    let delivery = deliver_one(&pipeline, "postmaster").await;

    assert_eq!(target.committed()[0].recipients, vec!["admin@example.org"]);
    assert_eq!(
        delivery.metadata().original_rcpts.get("admin@example.org"),
        Some(&"postmaster".to_owned())
    );
}

#[test_log::test(tokio::test)]
async fn untouched_recipients_leave_no_original_entry() {
    let (_dir, aliases) = alias_group("test: test2\n").await;
    let target = MockTarget::new();
    let pipeline =
        Pipeline::new(single_target_with(aliases, Group::empty(), target.clone())).unwrap();

    let delivery = deliver_one(&pipeline, "other@example.com").await;

    assert_eq!(target.committed()[0].recipients, vec!["other@example.com"]);
    assert!(delivery.metadata().original_rcpts.is_empty());
}

#[test_log::test(tokio::test)]
async fn per_block_aliases_also_record_originals() {
    // the alias modifier sits on the recipient block instead of the root.
    let (_dir, aliases) = alias_group("test: test2\n").await;
    let target = MockTarget::new();
    let pipeline =
        Pipeline::new(single_target_with(Group::empty(), aliases, target.clone())).unwrap();

    let delivery = deliver_one(&pipeline, "Test@example.com").await;

    assert_eq!(target.committed()[0].recipients, vec!["test2@example.com"]);
    assert_eq!(
        delivery.metadata().original_rcpts.get("test2@example.com"),
        Some(&"Test@example.com".to_owned())
    );
}
