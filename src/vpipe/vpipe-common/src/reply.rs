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

/// Enhanced status code triple (RFC 3463), e.g. `5.7.1`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
)]
pub struct EnhancedCode(pub u8, pub u16, pub u16);

impl EnhancedCode {
    /// Class of the code (`4` for transient, `5` for permanent).
    #[must_use]
    #[inline]
    pub const fn class(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for EnhancedCode {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

impl std::str::FromStr for EnhancedCode {
    type Err = anyhow::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digits = s.split('.');
        let (class, subject, detail) = match (
            digits.next(),
            digits.next(),
            digits.next(),
            digits.next(),
        ) {
            (Some(class), Some(subject), Some(detail), None) => (class, subject, detail),
            _ => anyhow::bail!("'{s}' is not an enhanced status code"),
        };
        Ok(Self(class.parse()?, subject.parse()?, detail.parse()?))
    }
}

/// An SMTP reply: status code, optional enhanced code and a text line.
///
/// This is the wire-facing form of every decision the pipeline takes:
/// routing rejects, check rejects, score and DMARC enforcement all surface
/// as a [`Reply`]. Temporariness is carried by the status code class.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
)]
pub struct Reply {
    code: u16,
    enhanced: Option<EnhancedCode>,
    text: String,
}

impl Reply {
    /// Build a reply from its parts.
    #[must_use]
    #[inline]
    pub fn new(code: u16, enhanced: EnhancedCode, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: Some(enhanced),
            text: text.into(),
        }
    }

    /// Build a reply without an enhanced status code.
    #[must_use]
    #[inline]
    pub fn basic(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: None,
            text: text.into(),
        }
    }

    /// SMTP status code.
    #[must_use]
    #[inline]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// Enhanced status code, if any.
    #[must_use]
    #[inline]
    pub const fn enhanced(&self) -> Option<EnhancedCode> {
        self.enhanced
    }

    /// Human-readable text of the reply.
    #[must_use]
    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Is this a transient (4xx) failure?
    #[must_use]
    #[inline]
    pub const fn is_temporary(&self) -> bool {
        self.code / 100 == 4
    }

    /// `501 5.1.3` — the sender or recipient address does not parse.
    #[must_use]
    pub fn invalid_address() -> Self {
        Self::new(501, EnhancedCode(5, 1, 3), "Invalid address")
    }

    /// `554 5.0.0` — generic permanent failure, used when a collaborator
    /// error carries no SMTP annotation.
    #[must_use]
    pub fn internal_permanent() -> Self {
        Self::new(554, EnhancedCode(5, 0, 0), "Internal server error")
    }

    /// `451 4.0.0` — generic transient failure.
    #[must_use]
    pub fn internal_temporary() -> Self {
        Self::new(451, EnhancedCode(4, 0, 0), "Internal server error")
    }

    /// `451 4.3.0` — the transaction was cancelled by the caller.
    #[must_use]
    pub fn transaction_cancelled() -> Self {
        Self::new(451, EnhancedCode(4, 3, 0), "Transaction cancelled")
    }

    /// `554 5.7.0` — default reply of the `reject` configuration directive.
    #[must_use]
    pub fn policy_reject() -> Self {
        Self::new(
            554,
            EnhancedCode(5, 7, 0),
            "Message rejected due to a local policy",
        )
    }

    /// `550 5.7.0` — the accumulated check score crossed the reject
    /// threshold.
    #[must_use]
    pub fn score_reject(score: i32) -> Self {
        Self::new(
            550,
            EnhancedCode(5, 7, 0),
            format!(
                "Message is rejected due to multiple local policy violations (score {score})"
            ),
        )
    }

    /// `550 5.7.1` — DMARC policy evaluation failed with `p=reject`.
    #[must_use]
    pub fn dmarc_failed() -> Self {
        Self::new(550, EnhancedCode(5, 7, 1), "DMARC check failed")
    }
}

impl std::fmt::Display for Reply {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.enhanced {
            Some(enhanced) => write!(f, "{} {} {}", self.code, enhanced, self.text),
            None => write!(f, "{} {}", self.code, self.text),
        }
    }
}

impl std::str::FromStr for Reply {
    type Err = anyhow::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end_matches("\r\n");
        let (code, rest) = s
            .split_once(' ')
            .ok_or_else(|| anyhow::anyhow!("'{s}' is not an smtp reply"))?;
        let code = code.parse::<u16>()?;
        if !(200..=599).contains(&code) {
            anyhow::bail!("'{code}' is not an smtp status code");
        }
        match rest.split_once(' ') {
            Some((maybe_enhanced, text)) => {
                maybe_enhanced.parse::<EnhancedCode>().map_or_else(
                    |_| {
                        Ok(Self {
                            code,
                            enhanced: None,
                            text: rest.to_owned(),
                        })
                    },
                    |enhanced| {
                        Ok(Self {
                            code,
                            enhanced: Some(enhanced),
                            text: text.to_owned(),
                        })
                    },
                )
            }
            None => Ok(rest.parse::<EnhancedCode>().map_or_else(
                |_| Self {
                    code,
                    enhanced: None,
                    text: rest.to_owned(),
                },
                |enhanced| Self {
                    code,
                    enhanced: Some(enhanced),
                    text: String::new(),
                },
            )),
        }
    }
}
