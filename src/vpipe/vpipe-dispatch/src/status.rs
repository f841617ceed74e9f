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

use vpipe_common::{Reply, StatusCollector};

/// Status sink wrapper that reports rewritten recipients under the address
/// the endpoint originally received.
///
/// Targets see the final (possibly alias-expanded) recipient; the caller
/// asked for a status on the address it submitted. The wrapper reverse-maps
/// through the transaction's `original_rcpts` before forwarding.
pub struct AutoresolveSink<'a> {
    inner: &'a mut dyn StatusCollector,
    original_rcpts: &'a std::collections::HashMap<String, String>,
}

impl<'a> AutoresolveSink<'a> {
    pub(crate) fn new(
        inner: &'a mut dyn StatusCollector,
        original_rcpts: &'a std::collections::HashMap<String, String>,
    ) -> Self {
        Self {
            inner,
            original_rcpts,
        }
    }
}

impl StatusCollector for AutoresolveSink<'_> {
    fn set_status(&mut self, rcpt_to: &str, status: Result<(), Reply>) {
        let original = self
            .original_rcpts
            .get(rcpt_to)
            .map_or(rcpt_to, String::as_str);
        self.inner.set_status(original, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder(Vec<(String, Result<(), Reply>)>);

    impl StatusCollector for Recorder {
        fn set_status(&mut self, rcpt_to: &str, status: Result<(), Reply>) {
            self.0.push((rcpt_to.to_owned(), status));
        }
    }

    #[test]
    fn rewritten_addresses_resolve_to_originals() {
        let originals = [(
            "test2@example.com".to_owned(),
            "test@example.com".to_owned(),
        )]
        .into_iter()
        .collect();

        let mut recorder = Recorder::default();
        let mut sink = AutoresolveSink::new(&mut recorder, &originals);
        sink.set_status("test2@example.com", Ok(()));
        sink.set_status("untouched@example.com", Err(Reply::policy_reject()));

        assert_eq!(
            recorder.0,
            vec![
                ("test@example.com".to_owned(), Ok(())),
                (
                    "untouched@example.com".to_owned(),
                    Err(Reply::policy_reject())
                ),
            ]
        );
    }
}
