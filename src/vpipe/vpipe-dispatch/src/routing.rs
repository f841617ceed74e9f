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

use vpipe_common::{address, Error, Reply};

/// Resolve `addr` against a routing map: complete address first, then the
/// domain, then the default block.
///
/// Pure on the lower-cased address, so two consecutive lookups always
/// agree. The empty address (SMTP null reverse-path) matches an empty key
/// or falls through to the default; the literal `postmaster` matches only
/// a `postmaster` key.
///
/// # Errors
///
/// * `501 5.1.3` — a non-empty address that does not split.
/// * the default reject when nothing matches and there is no default.
pub(crate) fn resolve<'a, B>(
    map: &'a std::collections::HashMap<String, std::sync::Arc<B>>,
    default: Option<&'a std::sync::Arc<B>>,
    addr: &str,
) -> Result<&'a std::sync::Arc<B>, Error> {
    let key = addr.to_lowercase();
    if let Some(block) = map.get(&key) {
        return Ok(block);
    }
    if !addr.is_empty() {
        let (_, domain) = address::split(&key)?;
        if !domain.is_empty() {
            if let Some(block) = map.get(domain) {
                return Ok(block);
            }
        }
    }
    default.map_or_else(|| Err(Reply::policy_reject().into()), Ok)
}
