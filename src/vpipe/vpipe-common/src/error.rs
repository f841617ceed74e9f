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

use crate::{address::InvalidAddress, Reply};

/// Error surfaced by the pipeline to the calling endpoint.
///
/// A [`Error::Reject`] carries the exact reply to put on the wire. Everything
/// else is an internal failure: its details are kept for logging but are
/// replaced by a generic reply before reaching the client, so that
/// collaborator internals (DNS errors, storage paths, ...) never leak.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A policy decision with its SMTP reply.
    #[error("{0}")]
    Reject(Reply),

    /// Any other failure from the pipeline or one of its collaborators.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The reply to send to the client for this error.
    #[must_use]
    #[inline]
    pub fn to_reply(&self) -> Reply {
        match self {
            Self::Reject(reply) => reply.clone(),
            Self::Other(_) => Reply::internal_permanent(),
        }
    }

    /// Is the failure transient?
    #[must_use]
    #[inline]
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Reject(reply) => reply.is_temporary(),
            Self::Other(_) => false,
        }
    }
}

impl From<Reply> for Error {
    #[inline]
    fn from(reply: Reply) -> Self {
        Self::Reject(reply)
    }
}

impl From<InvalidAddress> for Error {
    #[inline]
    fn from(_: InvalidAddress) -> Self {
        Self::Reject(Reply::invalid_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn internal_details_do_not_leak() {
        let error = Error::from(anyhow::anyhow!("connection to 10.0.0.3:5432 lost"));
        assert_eq!(error.to_reply(), Reply::internal_permanent());
        assert!(!error.is_temporary());
    }

    #[test]
    fn rejects_pass_through() {
        let error = Error::from(Reply::invalid_address());
        assert_eq!(error.to_reply().code(), 501);
    }

    #[test]
    fn invalid_address_maps_to_501() {
        let error: Error = InvalidAddress("a@b@c".to_owned()).into();
        let reply = error.to_reply();
        assert_eq!((reply.code(), reply.enhanced()), (501, Some(crate::EnhancedCode(5, 1, 3))));
    }
}
