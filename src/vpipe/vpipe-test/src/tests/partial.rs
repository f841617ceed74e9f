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

use crate::config::{local_meta, single_target, single_target_with};
use crate::mock::{MockCheck, MockTarget, StatusRecorder};
use pretty_assertions::assert_eq;
use vpipe_check::CheckRegistry;
use vpipe_common::{sync::CancellationToken, Header, MemoryBody, Reply};
use vpipe_dispatch::{Pipeline, RoutingConfig};
use vpipe_modify::{AliasFile, Group};

async fn non_atomic(
    pipeline: &Pipeline,
    rcpts: &[&str],
) -> (StatusRecorder, vpipe_dispatch::Delivery) {
    let token = CancellationToken::new();
    let mut delivery = pipeline
        .start(&token, local_meta("sender@example.org"), "sender@example.org")
        .await
        .unwrap();
    for rcpt in rcpts {
        delivery.add_rcpt(&token, rcpt).await.unwrap();
    }
    let mut recorder = StatusRecorder::new();
    delivery
        .body_non_atomic(
            &token,
            &mut recorder,
            Header::new(),
            std::sync::Arc::new(MemoryBody::from("body")),
        )
        .await;
    (recorder, delivery)
}

#[test_log::test(tokio::test)]
async fn per_recipient_failures_surface_under_original_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aliases");
    tokio::fs::write(&path, "renamed: tester\n").await.unwrap();
    let aliases = Group::new(vec![std::sync::Arc::new(
        AliasFile::new(vec![path]).await.unwrap(),
    )]);

    let reply = Reply::basic(550, "mailbox full");
    let target = MockTarget::partial_failing(&[("tester@example.org", reply.clone())]);
    let pipeline =
        Pipeline::new(single_target_with(aliases, Group::empty(), target.clone())).unwrap();

    let (recorder, mut delivery) =
        non_atomic(&pipeline, &["renamed@example.org", "tester2@example.org"]).await;
    delivery.commit().await.unwrap();

    // the target failed the rewritten `tester@example.org`; the status
    // surfaces under the address the caller actually sent.
    assert_eq!(
        recorder.statuses(),
        vec![
            ("renamed@example.org".to_owned(), Err(reply)),
            ("tester2@example.org".to_owned(), Ok(())),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn targets_without_partial_support_broadcast_one_result() {
    let reply = Reply::basic(451, "backend busy");
    let target = MockTarget::rejecting_body(reply.clone());
    let pipeline = Pipeline::new(single_target(target.clone())).unwrap();

    let (recorder, mut delivery) =
        non_atomic(&pipeline, &["one@example.org", "two@example.org"]).await;
    delivery.abort().await.unwrap();

    // property: the statuses carry the exact strings the caller passed,
    // in call order.
    assert_eq!(
        recorder.statuses(),
        vec![
            ("one@example.org".to_owned(), Err(reply.clone())),
            ("two@example.org".to_owned(), Err(reply)),
        ]
    );
    assert!(target.committed().is_empty());
}

#[test_log::test(tokio::test)]
async fn successful_broadcast_reports_every_recipient() {
    let target = MockTarget::new();
    let pipeline = Pipeline::new(single_target(target.clone())).unwrap();

    let (recorder, mut delivery) =
        non_atomic(&pipeline, &["one@example.org", "two@example.org"]).await;
    delivery.commit().await.unwrap();

    assert_eq!(
        recorder.statuses(),
        vec![
            ("one@example.org".to_owned(), Ok(())),
            ("two@example.org".to_owned(), Ok(())),
        ]
    );
    assert_eq!(target.committed().len(), 1);
}

#[test_log::test(tokio::test)]
async fn preamble_failure_is_reported_for_every_recipient() {
    let mut check = MockCheck::named("refuser");
    check.body.reject = Some(Reply::policy_reject());

    let mut registry = CheckRegistry::new();
    let target = MockTarget::new();
    let cfg = RoutingConfig::builder()
        .with_checks(vec![registry.register(std::sync::Arc::new(check))])
        .with_default_source(crate::config::source_to(target.clone()))
        .build()
        .unwrap();
    let pipeline = Pipeline::new(cfg).unwrap();

    let (recorder, mut delivery) =
        non_atomic(&pipeline, &["one@example.org", "two@example.org"]).await;
    delivery.abort().await.unwrap();

    assert_eq!(
        recorder.statuses(),
        vec![
            ("one@example.org".to_owned(), Err(Reply::policy_reject())),
            ("two@example.org".to_owned(), Err(Reply::policy_reject())),
        ]
    );
    assert!(target.committed().is_empty());
}
