use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// A single-holder lock whose `lock` races against a cancellation token.
///
/// Built on a binary semaphore rather than `tokio::sync::Mutex` so that
/// acquisition can be cleanly raced against cancellation with
/// `tokio::select!` instead of polling. `unlock` is non-blocking and panics
/// if the mutex was not held, matching the "unlock on unlocked mutex is a
/// programming error" contract. No recursive locking.
pub struct CtxMutex<T> {
    semaphore: Semaphore,
    held: AtomicBool,
    inner: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for CtxMutex<T> {}
unsafe impl<T: Send> Sync for CtxMutex<T> {}

impl<T> CtxMutex<T> {
    pub fn new(inner: T) -> Self {
        CtxMutex {
            semaphore: Semaphore::new(1),
            held: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Acquire the lock, or fail with `Error::Cancelled` if `token` fires first.
    pub async fn lock(&self, token: &CancellationToken) -> Result<CtxGuard<'_, T>> {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            permit = self.semaphore.acquire() => permit,
        };
        let permit = permit.expect("CtxMutex semaphore is never closed");
        permit.forget();
        self.held.store(true, Ordering::SeqCst);
        Ok(CtxGuard { mutex: self })
    }

    fn unlock(&self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            panic!("CtxMutex::unlock called on a mutex that was not locked");
        }
        self.semaphore.add_permits(1);
    }
}

/// RAII guard returned by [`CtxMutex::lock`]; releases the lock on drop.
pub struct CtxGuard<'a, T> {
    mutex: &'a CtxMutex<T>,
}

impl<'a, T> std::ops::Deref for CtxGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.inner.get() }
    }
}

impl<'a, T> std::ops::DerefMut for CtxGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.inner.get() }
    }
}

impl<'a, T> Drop for CtxGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn lock_and_unlock_round_trips() {
        let mutex = CtxMutex::new(0u32);
        let token = CancellationToken::new();
        {
            let mut guard = mutex.lock(&token).await.unwrap();
            *guard += 1;
        }
        let guard = mutex.lock(&token).await.unwrap();
        assert_eq!(*guard, 1);
    }

    #[tokio::test]
    async fn cancelled_token_fails_lock() {
        let mutex = Arc::new(CtxMutex::new(0u32));
        let token = CancellationToken::new();
        let _guard = mutex.lock(&token).await.unwrap();
        token.cancel();

        let mutex2 = mutex.clone();
        let token2 = token.clone();
        let handle =
            tokio::spawn(
                async move { matches!(mutex2.lock(&token2).await, Err(Error::Cancelled)) },
            );
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    #[should_panic(expected = "not locked")]
    async fn double_unlock_panics() {
        let mutex = CtxMutex::new(0u32);
        mutex.unlock();
    }
}
