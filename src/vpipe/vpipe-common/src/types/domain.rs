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

/// A domain name.
pub type Domain = trust_dns_resolver::Name;

/// Derive the organizational (registrable) domain of `domain`.
///
/// `mail.corp.example.co.uk` maps to `example.co.uk`. Domains that have no
/// registrable form (single labels, effective TLDs) are returned unchanged.
#[must_use]
pub fn organizational_domain(domain: &str) -> String {
    addr::parse_domain_name(domain)
        .ok()
        .and_then(|name| name.root())
        .unwrap_or(domain)
        .to_owned()
}
