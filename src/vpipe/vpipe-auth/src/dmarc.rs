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

use crate::{AuthResult, Value};
use vpipe_common::{domain::organizational_domain, Header};

/// Requested policy of a DMARC record (`p=`/`sp=` tag).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, serde::Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Collect reports, enforce nothing.
    None,
    /// File failing mail away from the inbox.
    Quarantine,
    /// Refuse failing mail outright.
    Reject,
}

/// Identifier alignment mode (`adkim=`/`aspf=` tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AlignmentMode {
    /// Organizational domains must match.
    Relaxed,
    /// Domains must match exactly.
    Strict,
}

/// A parsed DMARC record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Record {
    ///
    pub policy: Policy,
    /// Policy for subdomains of the organizational domain, when distinct.
    pub subdomain_policy: Option<Policy>,
    /// Percentage of failing messages the policy applies to.
    pub pct: u8,
    ///
    pub adkim: AlignmentMode,
    ///
    pub aspf: AlignmentMode,
}

/// The TXT record does not describe a valid DMARC policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The record does not start with `v=DMARC1`.
    #[error("not a DMARC1 record")]
    BadVersion,
    /// The mandatory `p=` tag is missing or unknown.
    #[error("missing or invalid policy tag")]
    BadPolicy,
    /// A tag value could not be parsed.
    #[error("invalid value for tag '{0}'")]
    BadTag(String),
}

impl std::str::FromStr for Record {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tags = s.split(';').map(str::trim).filter(|tag| !tag.is_empty());
        if tags.next().map(|tag| tag.replace(' ', "")) != Some("v=DMARC1".to_owned()) {
            return Err(RecordError::BadVersion);
        }

        let mut policy = None;
        let mut subdomain_policy = None;
        let mut pct = 100_u8;
        let mut adkim = AlignmentMode::Relaxed;
        let mut aspf = AlignmentMode::Relaxed;

        for tag in tags {
            let Some((name, value)) = tag.split_once('=') else {
                return Err(RecordError::BadTag(tag.to_owned()));
            };
            let (name, value) = (name.trim(), value.trim());
            match name {
                "p" => {
                    policy = Some(
                        value
                            .parse::<Policy>()
                            .map_err(|_| RecordError::BadPolicy)?,
                    );
                }
                "sp" => {
                    subdomain_policy = Some(
                        value
                            .parse::<Policy>()
                            .map_err(|_| RecordError::BadTag(name.to_owned()))?,
                    );
                }
                "pct" => {
                    pct = value
                        .parse::<u8>()
                        .ok()
                        .filter(|pct| *pct <= 100)
                        .ok_or_else(|| RecordError::BadTag(name.to_owned()))?;
                }
                "adkim" => adkim = parse_alignment(value).ok_or_else(|| RecordError::BadTag(name.to_owned()))?,
                "aspf" => aspf = parse_alignment(value).ok_or_else(|| RecordError::BadTag(name.to_owned()))?,
                // rua/ruf/fo/rf/ri and future tags are ignored.
                _ => {}
            }
        }

        Ok(Self {
            policy: policy.ok_or(RecordError::BadPolicy)?,
            subdomain_policy,
            pct,
            adkim,
            aspf,
        })
    }
}

fn parse_alignment(value: &str) -> Option<AlignmentMode> {
    match value {
        "r" => Some(AlignmentMode::Relaxed),
        "s" => Some(AlignmentMode::Strict),
        _ => None,
    }
}

/// Failure of a TXT lookup, split the way DMARC reporting needs it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The name exists but carries no TXT record (or does not exist).
    #[error("no TXT record")]
    NotFound,
    /// Transient DNS failure; reported as `temperror`.
    #[error("temporary dns failure: {0}")]
    Temporary(String),
    /// The record exists but cannot be used; reported as `permerror`.
    #[error("invalid DMARC record: {0}")]
    Invalid(#[from] RecordError),
}

/// TXT record source. Production uses [`DnsResolver`]; tests substitute a
/// static zone.
#[async_trait::async_trait]
pub trait TxtResolver: Send + Sync {
    /// All TXT strings published at `name`.
    ///
    /// # Errors
    ///
    /// * the lookup failed, see [`LookupError`].
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, LookupError>;
}

/// [`TxtResolver`] over trust-dns.
pub struct DnsResolver {
    inner: trust_dns_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    /// Resolver configured from `/etc/resolv.conf`.
    ///
    /// # Errors
    ///
    /// * the system resolver configuration cannot be read.
    pub fn from_system_conf() -> anyhow::Result<Self> {
        Ok(Self {
            inner: trust_dns_resolver::TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl TxtResolver for DnsResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, LookupError> {
        match self.inner.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.iter()
                        .map(|data| String::from_utf8_lossy(data).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Err(error) => match error.kind() {
                trust_dns_resolver::error::ResolveErrorKind::NoRecordsFound { .. } => {
                    Err(LookupError::NotFound)
                }
                _ => Err(LookupError::Temporary(error.to_string())),
            },
        }
    }
}

/// Fetch and parse the DMARC record governing `from_domain`.
///
/// The lookup targets `_dmarc.<organizational domain>`; an absent record is
/// not an error (`Ok(None)`).
///
/// # Errors
///
/// * transient DNS failure (`temperror`).
/// * a published record that does not parse (`permerror`).
pub async fn lookup_record(
    resolver: &dyn TxtResolver,
    from_domain: &str,
) -> Result<Option<Record>, LookupError> {
    let name = format!("_dmarc.{}", organizational_domain(from_domain));
    let records = match resolver.txt_lookup(&name).await {
        Ok(records) => records,
        Err(LookupError::NotFound) => return Ok(None),
        Err(error) => return Err(error),
    };
    let Some(record) = records.iter().find(|txt| txt.starts_with("v=DMARC")) else {
        return Ok(None);
    };
    Ok(Some(record.parse::<Record>()?))
}

/// Evaluate DMARC alignment of `from_domain` against the collected
/// SPF/DKIM results.
///
/// The verdict is [`Value::Pass`] when at least one passing DKIM signature
/// or SPF evaluation is aligned with the From domain under the record's
/// alignment mode, [`Value::Fail`] otherwise.
#[must_use]
pub fn evaluate(record: &Record, from_domain: &str, results: &[AuthResult]) -> Value {
    for result in results {
        match result {
            AuthResult::Dkim(dkim) if dkim.value == Value::Pass => {
                if aligned(&dkim.domain, from_domain, record.adkim) {
                    return Value::Pass;
                }
            }
            AuthResult::Spf(spf) if spf.value == Value::Pass => {
                let domain = spf
                    .from
                    .rsplit_once('@')
                    .map_or(spf.helo.as_str(), |(_, domain)| domain);
                if aligned(domain, from_domain, record.aspf) {
                    return Value::Pass;
                }
            }
            _ => {}
        }
    }
    Value::Fail
}

fn aligned(domain: &str, from_domain: &str, mode: AlignmentMode) -> bool {
    if domain.is_empty() {
        return false;
    }
    match mode {
        AlignmentMode::Strict => domain.eq_ignore_ascii_case(from_domain),
        AlignmentMode::Relaxed => organizational_domain(&domain.to_lowercase())
            == organizational_domain(&from_domain.to_lowercase()),
    }
}

/// Domain of the RFC 5322 From header, the identifier DMARC protects.
///
/// Returns `None` when the header is absent or does not contain a parsable
/// address.
#[must_use]
pub fn from_header_domain(header: &Header) -> Option<String> {
    let from = header.get_first("From")?;
    let addr = match (from.rfind('<'), from.rfind('>')) {
        (Some(open), Some(close)) if open < close => &from[open + 1..close],
        _ => from.trim(),
    };
    let (_, domain) = addr.rsplit_once('@')?;
    if domain.is_empty() {
        return None;
    }
    Some(domain.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vpipe_common::HeaderField;

    #[test]
    fn record_minimal() {
        let record = "v=DMARC1; p=reject".parse::<Record>().unwrap();
        assert_eq!(record.policy, Policy::Reject);
        assert_eq!(record.pct, 100);
        assert_eq!(record.adkim, AlignmentMode::Relaxed);
    }

    #[test]
    fn record_full() {
        let record = "v=DMARC1; p=quarantine; sp=none; pct=30; adkim=s; aspf=r; rua=mailto:x@example.com"
            .parse::<Record>()
            .unwrap();
        assert_eq!(record.policy, Policy::Quarantine);
        assert_eq!(record.subdomain_policy, Some(Policy::None));
        assert_eq!(record.pct, 30);
        assert_eq!(record.adkim, AlignmentMode::Strict);
        assert_eq!(record.aspf, AlignmentMode::Relaxed);
    }

    #[rstest::rstest]
    #[case("v=spf1 include:example.com ~all", RecordError::BadVersion)]
    #[case("v=DMARC1", RecordError::BadPolicy)]
    #[case("v=DMARC1; p=destroy", RecordError::BadPolicy)]
    #[case("v=DMARC1; p=none; pct=250", RecordError::BadTag("pct".to_owned()))]
    fn record_errors(#[case] txt: &str, #[case] expected: RecordError) {
        assert_eq!(txt.parse::<Record>().unwrap_err(), expected);
    }

    #[test]
    fn alignment_relaxed_vs_strict() {
        let relaxed = "v=DMARC1; p=reject".parse::<Record>().unwrap();
        let strict = "v=DMARC1; p=reject; adkim=s".parse::<Record>().unwrap();

        let results = [AuthResult::Dkim(crate::DkimResult {
            value: Value::Pass,
            domain: "mail.example.com".to_owned(),
            identifier: String::new(),
        })];

        assert_eq!(evaluate(&relaxed, "example.com", &results), Value::Pass);
        assert_eq!(evaluate(&strict, "example.com", &results), Value::Fail);
    }

    #[test]
    fn misaligned_pass_fails() {
        let record = "v=DMARC1; p=reject".parse::<Record>().unwrap();
        let results = [AuthResult::Dkim(crate::DkimResult {
            value: Value::Pass,
            domain: "example.org".to_owned(),
            identifier: String::new(),
        })];
        assert_eq!(evaluate(&record, "example.com", &results), Value::Fail);
    }

    #[test]
    fn spf_alignment_uses_sender_domain() {
        let record = "v=DMARC1; p=reject".parse::<Record>().unwrap();
        let results = [AuthResult::Spf(crate::SpfResult {
            value: Value::Pass,
            from: "who@news.example.com".to_owned(),
            helo: String::new(),
        })];
        assert_eq!(evaluate(&record, "example.com", &results), Value::Pass);
    }

    #[test]
    fn from_domain_extraction() {
        let mut header = Header::new();
        header.add_field(HeaderField::new("From", "Hello World <hello@example.com>"));
        assert_eq!(from_header_domain(&header), Some("example.com".to_owned()));

        let mut bare = Header::new();
        bare.add("From", "hello@example.com");
        assert_eq!(from_header_domain(&bare), Some("example.com".to_owned()));

        assert_eq!(from_header_domain(&Header::new()), None);
    }

    struct StaticZone(std::collections::HashMap<String, Vec<String>>);

    #[async_trait::async_trait]
    impl TxtResolver for StaticZone {
        async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, LookupError> {
            self.0.get(name).cloned().ok_or(LookupError::NotFound)
        }
    }

    #[tokio::test]
    async fn lookup_on_organizational_domain() {
        let zone = StaticZone(
            [(
                "_dmarc.example.com".to_owned(),
                vec!["v=DMARC1; p=reject".to_owned()],
            )]
            .into_iter()
            .collect(),
        );

        let record = lookup_record(&zone, "mail.example.com").await.unwrap();
        assert_eq!(record.unwrap().policy, Policy::Reject);

        assert_eq!(lookup_record(&zone, "example.org").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lookup_bad_record_is_invalid() {
        let zone = StaticZone(
            [(
                "_dmarc.example.com".to_owned(),
                vec!["v=DMARC1; p=banana".to_owned()],
            )]
            .into_iter()
            .collect(),
        );
        assert!(matches!(
            lookup_record(&zone, "example.com").await,
            Err(LookupError::Invalid(_))
        ));
    }
}
