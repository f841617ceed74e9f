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

//! Mail address normalization.
//!
//! Addresses are carried through the pipeline as plain strings so that the
//! verbatim form the client sent is preserved end to end; this module is the
//! single place that decides what is a valid address and how it splits into
//! local part and domain. The literal `postmaster` (without a domain) is a
//! complete address, as required by RFC 5321.

use crate::Domain;

/// The address could not be parsed as `local-part@domain`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a valid address")]
pub struct InvalidAddress(pub String);

/// Is `addr` a complete, deliverable address?
///
/// The literal `postmaster` (any case, no `@`) is accepted. The empty string
/// is *not* an address; the null reverse-path is handled by routing, not
/// here.
#[must_use]
pub fn valid(addr: &str) -> bool {
    addr.eq_ignore_ascii_case("postmaster") || split(addr).is_ok()
}

/// Is `domain` a syntactically valid domain name?
#[must_use]
pub fn valid_domain(domain: &str) -> bool {
    !domain.is_empty() && addr::parse_domain_name(domain).is_ok()
}

/// Split `addr` into its local part and domain.
///
/// `postmaster` splits into `("postmaster", "")`.
///
/// # Errors
///
/// * the address does not parse as `local-part@domain`.
pub fn split(addr: &str) -> Result<(&str, &str), InvalidAddress> {
    if addr.eq_ignore_ascii_case("postmaster") {
        return Ok((addr, ""));
    }
    if addr::parse_email_address(addr).is_err() {
        return Err(InvalidAddress(addr.to_owned()));
    }
    let at_sign = addr
        .rfind('@')
        .ok_or_else(|| InvalidAddress(addr.to_owned()))?;
    let (local_part, domain) = (&addr[..at_sign], &addr[at_sign + 1..]);
    if local_part.is_empty() || domain.is_empty() {
        return Err(InvalidAddress(addr.to_owned()));
    }
    Ok((local_part, domain))
}

/// Convert the domain part of `addr` to its IDNA ASCII (punycode) form.
///
/// # Errors
///
/// * the address is not valid.
/// * the domain cannot be represented in ASCII.
pub fn to_ascii(addr: &str) -> Result<String, InvalidAddress> {
    let (local_part, domain) = split(addr)?;
    if domain.is_empty() {
        return Ok(addr.to_owned());
    }
    let domain =
        Domain::from_utf8(domain).map_err(|_| InvalidAddress(addr.to_owned()))?;
    Ok(format!("{local_part}@{}", domain.to_ascii().trim_end_matches('.')))
}

/// Convert the domain part of `addr` to its IDNA Unicode form.
///
/// # Errors
///
/// * the address is not valid.
pub fn to_unicode(addr: &str) -> Result<String, InvalidAddress> {
    let (local_part, domain) = split(addr)?;
    if domain.is_empty() {
        return Ok(addr.to_owned());
    }
    let domain =
        Domain::from_utf8(domain).map_err(|_| InvalidAddress(addr.to_owned()))?;
    Ok(format!("{local_part}@{}", domain.to_utf8().trim_end_matches('.')))
}
