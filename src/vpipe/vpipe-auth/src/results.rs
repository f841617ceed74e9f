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

/// Method result value, a subset of the RFC 8601 result registry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Value {
    /// No verification was performed.
    None,
    /// The method yielded no usable verdict.
    Neutral,
    ///
    Pass,
    ///
    Fail,
    /// Weak failure (SPF `~all`).
    SoftFail,
    /// Transient error during verification.
    TempError,
    /// Permanent error during verification (malformed records, ...).
    PermError,
}

/// Result of an SPF evaluation over the envelope sender.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpfResult {
    ///
    pub value: Value,
    /// Envelope sender the evaluation ran against (`smtp.mailfrom`).
    pub from: String,
    /// HELO identity, used when the envelope sender is null.
    pub helo: String,
}

/// Result of one DKIM signature verification.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DkimResult {
    ///
    pub value: Value,
    /// Signing domain (`d=` tag).
    pub domain: String,
    /// Agent or user identifier (`i=` tag), when present.
    pub identifier: String,
}

/// Result of the DMARC policy evaluation for the From domain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DmarcResult {
    ///
    pub value: Value,
    /// Domain of the RFC 5322 From header.
    pub from_domain: String,
}

/// One entry of the combined `Authentication-Results` header.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuthResult {
    ///
    Spf(SpfResult),
    ///
    Dkim(DkimResult),
    ///
    Dmarc(DmarcResult),
}

impl std::fmt::Display for AuthResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spf(spf) => {
                write!(f, "spf={}", spf.value)?;
                if spf.from.is_empty() {
                    write!(f, " smtp.helo={}", spf.helo)
                } else {
                    write!(f, " smtp.mailfrom={}", spf.from)
                }
            }
            Self::Dkim(dkim) => {
                write!(f, "dkim={} header.d={}", dkim.value, dkim.domain)?;
                if !dkim.identifier.is_empty() {
                    write!(f, " header.i={}", dkim.identifier)?;
                }
                Ok(())
            }
            Self::Dmarc(dmarc) => {
                write!(f, "dmarc={} header.from={}", dmarc.value, dmarc.from_domain)
            }
        }
    }
}

/// Build the value of the single `Authentication-Results` header this host
/// stamps on the message, `hostname; method=value ...; method=value ...`.
///
/// An empty result list yields the RFC 8601 `none` form.
#[must_use]
pub fn format_header(hostname: &str, results: &[AuthResult]) -> String {
    if results.is_empty() {
        return format!("{hostname}; none");
    }
    let mut value = String::from(hostname);
    for result in results {
        value.push_str(";\r\n\t");
        value.push_str(&result.to_string());
    }
    value
}
