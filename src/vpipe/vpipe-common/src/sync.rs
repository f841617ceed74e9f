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

pub use tokio_util::sync::CancellationToken;

/// The awaited operation was cancelled through its [`CancellationToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// A value produced once and awaited from any number of tasks.
#[derive(Debug, Clone)]
pub struct OneShot<T> {
    tx: tokio::sync::watch::Sender<Option<T>>,
    rx: tokio::sync::watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> OneShot<T> {
    ///
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::watch::channel(None);
        Self { tx, rx }
    }

    /// Publish the value.
    ///
    /// # Panics
    ///
    /// * the value has already been set.
    pub fn set(&self, value: T) {
        self.tx.send_modify(|slot| {
            assert!(slot.is_none(), "one-shot value set twice");
            *slot = Some(value);
        });
    }

    /// Wait until the value is published.
    #[allow(clippy::expect_used)]
    pub async fn get(&self) -> T {
        let mut rx = self.rx.clone();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            rx.changed()
                .await
                .expect("the sender half lives as long as any handle");
        }
    }

    /// Wait until the value is published or `token` is cancelled.
    ///
    /// # Errors
    ///
    /// * the token was cancelled first.
    pub async fn get_or_cancel(&self, token: &CancellationToken) -> Result<T, Cancelled> {
        tokio::select! {
            () = token.cancelled() => Err(Cancelled),
            value = self.get() => Ok(value),
        }
    }
}

/// Counting semaphore. A non-positive capacity degrades acquisition to a
/// no-op, which lets "no limit" configurations share the code path.
#[derive(Debug)]
pub struct Semaphore {
    inner: Option<tokio::sync::Semaphore>,
}

impl Semaphore {
    ///
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn new(capacity: i64) -> Self {
        Self {
            inner: (capacity > 0).then(|| tokio::sync::Semaphore::new(capacity as usize)),
        }
    }

    /// Acquire one slot, waiting if the semaphore is exhausted. Returns
    /// `None` when this semaphore is a no-op.
    #[allow(clippy::expect_used)]
    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        match &self.inner {
            Some(semaphore) => Some(
                semaphore
                    .acquire()
                    .await
                    .expect("the semaphore is never closed"),
            ),
            None => None,
        }
    }
}

/// A boolean that latches to `true`, shareable between tasks.
#[derive(Debug, Default)]
pub struct AtomicFlag(std::sync::atomic::AtomicBool);

impl AtomicFlag {
    ///
    pub fn set(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    ///
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_shot_set_then_get() {
        let slot = OneShot::new();
        slot.set(42);
        assert_eq!(slot.get().await, 42);
        // a second getter observes the same value.
        assert_eq!(slot.get().await, 42);
    }

    #[tokio::test]
    async fn one_shot_wakes_waiters() {
        let slot = OneShot::<&'static str>::new();
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.get().await })
        };
        slot.set("done");
        assert_eq!(waiter.await.unwrap(), "done");
    }

    #[tokio::test]
    #[should_panic(expected = "one-shot value set twice")]
    async fn one_shot_double_set_panics() {
        let slot = OneShot::new();
        slot.set(1);
        slot.set(2);
    }

    #[tokio::test]
    async fn one_shot_cancellation() {
        let slot = OneShot::<u8>::new();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(slot.get_or_cancel(&token).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn semaphore_limits() {
        let semaphore = Semaphore::new(1);
        let permit = semaphore.acquire().await;
        assert!(permit.is_some());
        drop(permit);
        assert!(semaphore.acquire().await.is_some());
    }

    #[tokio::test]
    async fn semaphore_nop() {
        let semaphore = Semaphore::new(0);
        assert!(semaphore.acquire().await.is_none());
        assert!(semaphore.acquire().await.is_none());

        let negative = Semaphore::new(-3);
        assert!(negative.acquire().await.is_none());
    }

    #[test]
    fn flag_latches() {
        let flag = AtomicFlag::default();
        assert!(!flag.is_set());
        flag.set();
        flag.set();
        assert!(flag.is_set());
    }
}
