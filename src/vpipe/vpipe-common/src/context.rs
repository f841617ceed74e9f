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

use crate::HeaderField;

/// Protocol announced by the client for the ongoing transaction.
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
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Plain RFC 5321.
    Smtp,
    /// SMTP with extensions.
    Esmtp,
    /// SMTP with extensions over TLS.
    Esmtps,
    /// Local mail transfer protocol (RFC 2033).
    Lmtp,
}

/// TLS parameters of the client connection, frozen at handshake time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TlsSnapshot {
    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub protocol_version: String,
    /// Negotiated cipher suite.
    pub cipher_suite: String,
}

/// Snapshot of the client connection, available before any transaction
/// state exists. This is all an early (pre-`MAIL FROM`) check may observe.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionState {
    /// Hostname the client announced, if any.
    pub client_hostname: Option<String>,
    /// Network address of the client, if the connection has one.
    pub client_addr: Option<std::net::SocketAddr>,
    /// Local address which accepted the connection.
    pub server_addr: Option<std::net::SocketAddr>,
    ///
    pub proto: Protocol,
    ///
    pub tls: Option<TlsSnapshot>,
}

/// Per-transaction message metadata.
///
/// The endpoint owns the metadata for the duration of the transaction and
/// hands it to the pipeline at `start`. The pipeline mutates only the
/// delivery [`id`](Self::id) (set once), the latched
/// [`quarantine`](Self::quarantine) flag and the
/// [`original_rcpts`](Self::original_rcpts) map.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MsgMetadata {
    /// Opaque delivery identifier, hex form. Empty until `start`.
    pub id: String,
    /// Sender exactly as received by the endpoint, before any rewrite.
    pub original_from: String,
    /// Hostname the client announced, if any.
    pub src_hostname: Option<String>,
    /// Network address of the client, if any.
    pub src_addr: Option<std::net::SocketAddr>,
    ///
    pub proto: Protocol,
    /// Name this server identifies as, used in trace headers.
    pub our_hostname: String,
    /// The client did not authenticate.
    pub anonymous: bool,
    /// Authorization identity established by the endpoint, if any.
    pub auth_identity: Option<String>,
    ///
    pub tls: Option<TlsSnapshot>,
    /// Size of the body announced by the client, when known.
    pub body_size_hint: Option<u64>,
    /// Latched quarantine flag; storage targets file quarantined mail
    /// separately. Once set it is never cleared.
    pub quarantine: bool,
    /// Rewritten recipient address (as delivered) to the address the
    /// endpoint originally received.
    pub original_rcpts: std::collections::HashMap<String, String>,
}

impl MsgMetadata {
    /// Metadata for a fresh transaction.
    #[must_use]
    pub fn new(proto: Protocol, our_hostname: impl Into<String>, original_from: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            original_from: original_from.into(),
            src_hostname: None,
            src_addr: None,
            proto,
            our_hostname: our_hostname.into(),
            anonymous: true,
            auth_identity: None,
            tls: None,
            body_size_hint: None,
            quarantine: false,
            original_rcpts: std::collections::HashMap::new(),
        }
    }

    /// Synthesize the `Received:` trace field for one recipient of this
    /// transaction.
    ///
    /// # Panics
    ///
    /// * the current date cannot be formatted (unreachable with a sane
    ///   clock).
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn received_header(&self, mail_from: &str, rcpt_to: &str) -> HeaderField {
        let src = self.src_hostname.as_deref().map_or_else(
            || {
                self.src_addr
                    .map_or_else(|| "unknown".to_owned(), |addr| addr.ip().to_string())
            },
            ToOwned::to_owned,
        );
        let date = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc2822)
            .expect("well-known format never fails on a utc timestamp");
        HeaderField::new(
            "Received",
            format!(
                "from {src} by {} (envelope-sender <{mail_from}>) with {} id {} for <{rcpt_to}>; {date}",
                self.our_hostname, self.proto, self.id
            ),
        )
    }
}

/// Generate a fresh delivery identifier: the hex encoding of 32
/// cryptographically random bytes.
#[must_use]
pub fn delivery_id() -> String {
    let (high, low) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
    let mut id = String::with_capacity(64);
    for byte in high.as_bytes().iter().chain(low.as_bytes()) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn delivery_id_shape() {
        let id = delivery_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, delivery_id());
    }

    #[test]
    fn protocol_tags() {
        assert_eq!(Protocol::Esmtps.to_string(), "ESMTPS");
        assert_eq!("LMTP".parse::<Protocol>().unwrap(), Protocol::Lmtp);
    }

    #[test]
    fn received_header_shape() {
        let mut meta = MsgMetadata::new(Protocol::Esmtp, "mx.example.com", "who@example.org");
        meta.id = delivery_id();
        meta.src_hostname = Some("client.example.org".to_owned());

        let field = meta.received_header("who@example.org", "rcpt@example.com");
        assert_eq!(field.name(), "Received");
        assert!(field.value().starts_with(&format!(
            "from client.example.org by mx.example.com (envelope-sender <who@example.org>) with ESMTP id {} for <rcpt@example.com>; ",
            meta.id
        )));
    }

    #[test]
    fn metadata_serde_round_trip() {
        let meta = MsgMetadata::new(Protocol::Smtp, "mx.example.com", "");
        let json = serde_json::to_string(&meta).unwrap();
        let back = serde_json::from_str::<MsgMetadata>(&json).unwrap();
        assert_eq!(back.our_hostname, "mx.example.com");
        assert!(back.anonymous);
    }
}
