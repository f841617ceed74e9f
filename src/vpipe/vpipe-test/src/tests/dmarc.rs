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

use crate::config::{local_meta, source_to};
use crate::mock::{MockCheck, MockTarget, StaticResolver};
use pretty_assertions::assert_eq;
use vpipe_auth::{dmarc::LookupError, AuthResult, DkimResult, Value};
use vpipe_check::CheckRegistry;
use vpipe_common::{sync::CancellationToken, Error, Header, MemoryBody, Reply};
use vpipe_dispatch::{Pipeline, RoutingConfig};

/// DMARC-enabled pipeline with one global check stamping a passing DKIM
/// result for `dkim_domain`.
fn dmarc_pipeline(
    target: std::sync::Arc<MockTarget>,
    resolver: std::sync::Arc<StaticResolver>,
    dkim_domain: &str,
) -> Pipeline {
    let mut registry = CheckRegistry::new();
    let dkim = registry.register(std::sync::Arc::new(MockCheck::stamping(
        "dkim",
        vec![AuthResult::Dkim(DkimResult {
            value: Value::Pass,
            domain: dkim_domain.to_owned(),
            identifier: String::new(),
        })],
    )));
    let cfg = RoutingConfig::builder()
        .with_checks(vec![dkim])
        .with_default_source(source_to(target))
        .with_dmarc()
        .build()
        .unwrap();
    Pipeline::with_resolver(cfg, resolver)
}

async fn send_from_example_com(pipeline: &Pipeline) -> Result<(), Error> {
    let token = CancellationToken::new();
    let mut delivery = pipeline
        .start(&token, local_meta("hello@example.com"), "hello@example.com")
        .await?;
    delivery.add_rcpt(&token, "rcpt@example.net").await?;

    let mut header = Header::new();
    header.add("From", "hello@example.com");
    let outcome = delivery
        .body(
            &token,
            header,
            std::sync::Arc::new(MemoryBody::from("hello")),
        )
        .await;
    match outcome {
        Ok(()) => delivery.commit().await,
        Err(error) => {
            delivery.abort().await.ok();
            Err(error)
        }
    }
}

#[test_log::test(tokio::test)]
async fn reject_policy_refuses_misaligned_mail() {
    let target = MockTarget::new();
    let pipeline = dmarc_pipeline(
        target.clone(),
        StaticResolver::dmarc("example.com", "v=DMARC1; p=reject"),
        // the only passing DKIM signature belongs to an unrelated domain.
        "example.org",
    );

    let error = send_from_example_com(&pipeline).await.unwrap_err();
    assert_eq!(error.to_reply(), Reply::dmarc_failed());
    assert!(target.committed().is_empty());
}

#[test_log::test(tokio::test)]
async fn aligned_signature_passes() {
    let target = MockTarget::new();
    let pipeline = dmarc_pipeline(
        target.clone(),
        StaticResolver::dmarc("example.com", "v=DMARC1; p=reject"),
        "example.com",
    );

    send_from_example_com(&pipeline).await.unwrap();

    let committed = target.committed();
    assert_eq!(committed.len(), 1);
    let auth = committed[0].header.get_first("Authentication-Results").unwrap();
    assert!(auth.contains("dmarc=pass"), "{auth}");
    assert!(auth.contains("dkim=pass"), "{auth}");
}

#[test_log::test(tokio::test)]
async fn quarantine_policy_latches_the_flag() {
    let target = MockTarget::new();
    let pipeline = dmarc_pipeline(
        target.clone(),
        StaticResolver::dmarc("example.com", "v=DMARC1; p=quarantine"),
        "example.org",
    );

    let token = CancellationToken::new();
    let mut delivery = pipeline
        .start(&token, local_meta("hello@example.com"), "hello@example.com")
        .await
        .unwrap();
    delivery.add_rcpt(&token, "rcpt@example.net").await.unwrap();
    let mut header = Header::new();
    header.add("From", "hello@example.com");
    delivery
        .body(&token, header, std::sync::Arc::new(MemoryBody::from("x")))
        .await
        .unwrap();
    assert!(delivery.metadata().quarantine);
    delivery.commit().await.unwrap();

    assert_eq!(target.committed().len(), 1);
}

#[test_log::test(tokio::test)]
async fn lookup_failures_never_reject() {
    let target = MockTarget::new();
    let pipeline = dmarc_pipeline(
        target.clone(),
        StaticResolver::failing(LookupError::Temporary("SERVFAIL".to_owned())),
        "example.org",
    );

    send_from_example_com(&pipeline).await.unwrap();

    let committed = target.committed();
    assert_eq!(committed.len(), 1);
    let auth = committed[0].header.get_first("Authentication-Results").unwrap();
    assert!(auth.contains("dmarc=temperror"), "{auth}");
}

#[test_log::test(tokio::test)]
async fn absent_policy_records_none() {
    let target = MockTarget::new();
    let pipeline = dmarc_pipeline(
        target.clone(),
        // a zone without any DMARC record.
        StaticResolver::dmarc("unrelated.example", "v=DMARC1; p=none"),
        "example.com",
    );

    send_from_example_com(&pipeline).await.unwrap();

    let auth = target.committed()[0]
        .header
        .get_first("Authentication-Results")
        .unwrap()
        .to_owned();
    assert!(auth.contains("dmarc=none"), "{auth}");
}
