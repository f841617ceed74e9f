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

use futures_util::FutureExt;
use vpipe_auth::{
    dmarc::{self, Policy, Record, TxtResolver},
    AuthResult, DmarcResult, Value,
};
use vpipe_common::{
    sync::{CancellationToken, OneShot},
    Header,
};

/// What the pipeline must do with the message after DMARC evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enforcement {
    Accept,
    Quarantine,
    Reject,
}

/// Outcome of the policy lookup, published through a one-shot future so
/// that the fetch overlaps with the body checks.
#[derive(Debug, Clone)]
enum Lookup {
    None { from_domain: String },
    Found { record: Record, from_domain: String },
    TempError { from_domain: String, error: String },
    PermError { from_domain: String, error: String },
}

/// Drives DMARC for one transaction: the record fetch starts when the body
/// checks begin and is joined in `apply_results`.
///
/// Lookup failures are fail-open: they surface as `temperror`/`permerror`
/// in the authentication results and never reject on their own.
pub(crate) struct DmarcEnforcer {
    resolver: std::sync::Arc<dyn TxtResolver>,
    lookup: Option<OneShot<Lookup>>,
}

impl DmarcEnforcer {
    pub(crate) fn new(resolver: std::sync::Arc<dyn TxtResolver>) -> Self {
        Self {
            resolver,
            lookup: None,
        }
    }

    /// Start the policy lookup for the From domain of `header`. Idempotent.
    pub(crate) fn start(&mut self, header: &Header) {
        if self.lookup.is_some() {
            return;
        }
        let slot = OneShot::new();
        self.lookup = Some(slot.clone());

        let resolver = self.resolver.clone();
        let from_domain = dmarc::from_header_domain(header);
        tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(fetch(resolver, from_domain))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!("DMARC policy fetch panicked");
                    Lookup::TempError {
                        from_domain: String::new(),
                        error: "policy fetch panicked".to_owned(),
                    }
                });
            slot.set(outcome);
        });
    }

    /// Join the lookup and evaluate alignment against the merged
    /// SPF/DKIM results.
    pub(crate) async fn enforce(
        &self,
        token: &CancellationToken,
        results: &[AuthResult],
    ) -> (Option<DmarcResult>, Enforcement) {
        let Some(lookup) = &self.lookup else {
            return (None, Enforcement::Accept);
        };
        let Ok(outcome) = lookup.get_or_cancel(token).await else {
            return (
                Some(DmarcResult {
                    value: Value::TempError,
                    from_domain: String::new(),
                }),
                Enforcement::Accept,
            );
        };

        match outcome {
            Lookup::None { from_domain } => (
                Some(DmarcResult {
                    value: Value::None,
                    from_domain,
                }),
                Enforcement::Accept,
            ),
            Lookup::TempError { from_domain, error } => {
                tracing::warn!(%error, "DMARC policy lookup failed, accepting");
                (
                    Some(DmarcResult {
                        value: Value::TempError,
                        from_domain,
                    }),
                    Enforcement::Accept,
                )
            }
            Lookup::PermError { from_domain, error } => {
                tracing::warn!(%error, "DMARC policy unusable, accepting");
                (
                    Some(DmarcResult {
                        value: Value::PermError,
                        from_domain,
                    }),
                    Enforcement::Accept,
                )
            }
            Lookup::Found {
                record,
                from_domain,
            } => {
                let verdict = dmarc::evaluate(&record, &from_domain, results);
                let enforcement = if verdict == Value::Pass {
                    Enforcement::Accept
                } else {
                    enforce_policy(&record)
                };
                (
                    Some(DmarcResult {
                        value: verdict,
                        from_domain,
                    }),
                    enforcement,
                )
            }
        }
    }
}

async fn fetch(
    resolver: std::sync::Arc<dyn TxtResolver>,
    from_domain: Option<String>,
) -> Lookup {
    let Some(from_domain) = from_domain else {
        return Lookup::PermError {
            from_domain: String::new(),
            error: "no usable From header domain".to_owned(),
        };
    };
    match dmarc::lookup_record(resolver.as_ref(), &from_domain).await {
        Ok(Some(record)) => Lookup::Found {
            record,
            from_domain,
        },
        Ok(None) => Lookup::None { from_domain },
        Err(error @ dmarc::LookupError::Invalid(_)) => Lookup::PermError {
            from_domain,
            error: error.to_string(),
        },
        Err(error) => Lookup::TempError {
            from_domain,
            error: error.to_string(),
        },
    }
}

/// Map a failed evaluation to its enforcement, honoring the `pct` sampling
/// tag: messages outside the sample get the next weaker policy.
fn enforce_policy(record: &Record) -> Enforcement {
    let sampled = record.pct >= 100 || fastrand::u8(0..100) < record.pct;
    match (record.policy, sampled) {
        (Policy::None, _) | (Policy::Quarantine, false) => Enforcement::Accept,
        (Policy::Quarantine, true) | (Policy::Reject, false) => Enforcement::Quarantine,
        (Policy::Reject, true) => Enforcement::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vpipe_auth::DkimResult;

    struct StaticZone(std::collections::HashMap<String, Vec<String>>);

    #[async_trait::async_trait]
    impl TxtResolver for StaticZone {
        async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, dmarc::LookupError> {
            self.0
                .get(name)
                .cloned()
                .ok_or(dmarc::LookupError::NotFound)
        }
    }

    struct FailingZone;

    #[async_trait::async_trait]
    impl TxtResolver for FailingZone {
        async fn txt_lookup(&self, _name: &str) -> Result<Vec<String>, dmarc::LookupError> {
            Err(dmarc::LookupError::Temporary("SERVFAIL".to_owned()))
        }
    }

    fn zone(policy: &str) -> std::sync::Arc<StaticZone> {
        std::sync::Arc::new(StaticZone(
            [(
                "_dmarc.example.com".to_owned(),
                vec![format!("v=DMARC1; p={policy}")],
            )]
            .into_iter()
            .collect(),
        ))
    }

    fn from_header() -> Header {
        let mut header = Header::new();
        header.add("From", "hello@example.com");
        header
    }

    fn aligned_dkim() -> Vec<AuthResult> {
        vec![AuthResult::Dkim(DkimResult {
            value: Value::Pass,
            domain: "example.com".to_owned(),
            identifier: String::new(),
        })]
    }

    fn misaligned_dkim() -> Vec<AuthResult> {
        vec![AuthResult::Dkim(DkimResult {
            value: Value::Pass,
            domain: "example.org".to_owned(),
            identifier: String::new(),
        })]
    }

    #[test_log::test(tokio::test)]
    async fn aligned_pass_accepts() {
        let token = CancellationToken::new();
        let mut enforcer = DmarcEnforcer::new(zone("reject"));
        enforcer.start(&from_header());

        let (result, enforcement) = enforcer.enforce(&token, &aligned_dkim()).await;
        assert_eq!(result.unwrap().value, Value::Pass);
        assert_eq!(enforcement, Enforcement::Accept);
    }

    #[test_log::test(tokio::test)]
    async fn misaligned_reject_policy_rejects() {
        let token = CancellationToken::new();
        let mut enforcer = DmarcEnforcer::new(zone("reject"));
        enforcer.start(&from_header());

        let (result, enforcement) = enforcer.enforce(&token, &misaligned_dkim()).await;
        assert_eq!(result.unwrap().value, Value::Fail);
        assert_eq!(enforcement, Enforcement::Reject);
    }

    #[test_log::test(tokio::test)]
    async fn misaligned_quarantine_policy_quarantines() {
        let token = CancellationToken::new();
        let mut enforcer = DmarcEnforcer::new(zone("quarantine"));
        enforcer.start(&from_header());

        let (_, enforcement) = enforcer.enforce(&token, &misaligned_dkim()).await;
        assert_eq!(enforcement, Enforcement::Quarantine);
    }

    #[test_log::test(tokio::test)]
    async fn lookup_failure_is_fail_open() {
        let token = CancellationToken::new();
        let mut enforcer = DmarcEnforcer::new(std::sync::Arc::new(FailingZone));
        enforcer.start(&from_header());

        let (result, enforcement) = enforcer.enforce(&token, &misaligned_dkim()).await;
        assert_eq!(result.unwrap().value, Value::TempError);
        assert_eq!(enforcement, Enforcement::Accept);
    }

    #[test_log::test(tokio::test)]
    async fn absent_record_is_none() {
        let token = CancellationToken::new();
        let mut enforcer = DmarcEnforcer::new(zone("reject"));
        let mut header = Header::new();
        header.add("From", "hello@example.org");
        enforcer.start(&header);

        let (result, enforcement) = enforcer.enforce(&token, &[]).await;
        assert_eq!(result.unwrap().value, Value::None);
        assert_eq!(enforcement, Enforcement::Accept);
    }

    #[test]
    fn pct_zero_never_enforces() {
        let record = "v=DMARC1; p=reject; pct=0".parse::<Record>().unwrap();
        assert_eq!(enforce_policy(&record), Enforcement::Quarantine);

        let quarantine = "v=DMARC1; p=quarantine; pct=0".parse::<Record>().unwrap();
        assert_eq!(enforce_policy(&quarantine), Enforcement::Accept);
    }

    #[test]
    fn pct_hundred_always_enforces() {
        let record = "v=DMARC1; p=reject".parse::<Record>().unwrap();
        assert_eq!(enforce_policy(&record), Enforcement::Reject);
    }
}
