//! Bounded pool of senders sharing mutable session state.
//!
//! The pool owns every sender for its whole lifetime; a channel of handles is
//! the only synchronization for borrow and return. Setters write the shared
//! record under a lock and broadcast to every sender — including ones
//! currently held — so any acquire that happens after a completed set
//! observes the new value.

use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::sender::{ReloginFn, Sender};

/// Default number of concurrent senders.
pub const DEFAULT_POOL_SIZE: usize = 3;

#[derive(Clone, Default)]
struct SharedState {
    bearer: String,
    crypto_key_hex: String,
    api_base: String,
    headers: String,
    cookie: String,
    debug: bool,
    relogin: Option<ReloginFn>,
}

/// Bounded set of senders with shared session state.
pub struct SenderPool {
    senders: Vec<Arc<Sender>>,
    slots: Mutex<mpsc::Receiver<Arc<Sender>>>,
    returns: mpsc::Sender<Arc<Sender>>,
    shared: RwLock<SharedState>,
}

impl SenderPool {
    /// Create a pool of `size` senders (0 selects the default size).
    pub fn new(
        size: usize,
        metadata_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let (returns, slots) = mpsc::channel(size);
        let mut senders = Vec::with_capacity(size);
        for _ in 0..size {
            let sender = Arc::new(Sender::new(metadata_timeout, transfer_timeout)?);
            // channel capacity equals the sender count, so this cannot fail
            let _ = returns.try_send(Arc::clone(&sender));
            senders.push(sender);
        }
        Ok(Arc::new(Self {
            senders,
            slots: Mutex::new(slots),
            returns,
            shared: RwLock::new(SharedState::default()),
        }))
    }

    fn shared(&self) -> std::sync::RwLockReadGuard<'_, SharedState> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared_mut(&self) -> std::sync::RwLockWriteGuard<'_, SharedState> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a sender is free, snapshot the shared session state into
    /// it, and hand it out behind a guard that returns it on drop.
    pub async fn acquire(self: &Arc<Self>) -> PooledSender {
        let sender = {
            let mut slots = self.slots.lock().await;
            // the pool owns the sending half, so the channel never closes
            slots.recv().await.expect("sender pool channel closed")
        };
        {
            let shared = self.shared();
            sender.set_bearer_token(&shared.bearer);
            sender.set_crypto_key_hex(&shared.crypto_key_hex);
            sender.set_api_base(&shared.api_base);
            sender.set_headers(&shared.headers);
            sender.set_cookie(&shared.cookie);
            sender.set_debug(shared.debug);
            sender.set_relogin(shared.relogin.clone());
        }
        PooledSender {
            sender,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, sender: &Arc<Sender>) {
        // keep a token rotated by the sender's auth-retry
        let token = sender.bearer_token();
        {
            let mut shared = self.shared_mut();
            if !token.is_empty() && token != shared.bearer {
                shared.bearer = token;
            }
        }
        let _ = self.returns.try_send(Arc::clone(sender));
    }

    pub fn set_bearer_token(&self, token: &str) {
        self.shared_mut().bearer = token.to_string();
        for sender in &self.senders {
            sender.set_bearer_token(token);
        }
    }

    pub fn bearer_token(&self) -> String {
        self.shared().bearer.clone()
    }

    pub fn set_crypto_key_hex(&self, key_hex: &str) {
        self.shared_mut().crypto_key_hex = key_hex.to_string();
        for sender in &self.senders {
            sender.set_crypto_key_hex(key_hex);
        }
    }

    pub fn crypto_key_hex(&self) -> String {
        self.shared().crypto_key_hex.clone()
    }

    pub fn set_api_base(&self, api_base: &str) {
        self.shared_mut().api_base = api_base.to_string();
        for sender in &self.senders {
            sender.set_api_base(api_base);
        }
    }

    pub fn api_base(&self) -> String {
        self.shared().api_base.clone()
    }

    pub fn set_headers(&self, headers: &str) {
        self.shared_mut().headers = headers.to_string();
        for sender in &self.senders {
            sender.set_headers(headers);
        }
    }

    pub fn headers(&self) -> String {
        self.shared().headers.clone()
    }

    pub fn set_cookie(&self, cookie: &str) {
        self.shared_mut().cookie = cookie.to_string();
        for sender in &self.senders {
            sender.set_cookie(cookie);
        }
    }

    pub fn set_debug(&self, debug: bool) {
        self.shared_mut().debug = debug;
        for sender in &self.senders {
            sender.set_debug(debug);
        }
    }

    pub fn debug(&self) -> bool {
        self.shared().debug
    }

    pub fn set_relogin(&self, relogin: Option<ReloginFn>) {
        self.shared_mut().relogin = relogin.clone();
        for sender in &self.senders {
            sender.set_relogin(relogin.clone());
        }
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }
}

/// A sender borrowed from the pool; returned exactly once on drop.
pub struct PooledSender {
    sender: Arc<Sender>,
    pool: Arc<SenderPool>,
}

impl Deref for PooledSender {
    type Target = Sender;

    fn deref(&self) -> &Sender {
        &self.sender
    }
}

impl Drop for PooledSender {
    fn drop(&mut self) {
        self.pool.release(&self.sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(size: usize) -> Arc<SenderPool> {
        SenderPool::new(size, Duration::from_secs(5), Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn test_setter_visible_to_next_acquire() {
        let pool = test_pool(2);
        pool.set_bearer_token("tok-a");
        let s = pool.acquire().await;
        assert_eq!(s.bearer_token(), "tok-a");
        drop(s);

        pool.set_bearer_token("tok-b");
        let s = pool.acquire().await;
        assert_eq!(s.bearer_token(), "tok-b");
    }

    #[tokio::test]
    async fn test_setter_reaches_held_sender() {
        let pool = test_pool(1);
        let held = pool.acquire().await;
        pool.set_crypto_key_hex("aa");
        assert_eq!(held.crypto_key_hex(), "aa");
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let pool = test_pool(1);
        let held = pool.acquire().await;

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire().await.bearer_token() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.set_bearer_token("after-release");
        drop(held);
        assert_eq!(waiter.await.unwrap(), "after-release");
    }

    #[tokio::test]
    async fn test_release_copies_back_rotated_bearer() {
        let pool = test_pool(1);
        pool.set_bearer_token("old");
        let s = pool.acquire().await;
        s.set_bearer_token("rotated");
        drop(s);
        assert_eq!(pool.bearer_token(), "rotated");
    }

    #[tokio::test]
    async fn test_zero_size_falls_back_to_default() {
        let pool = test_pool(0);
        assert_eq!(pool.size(), DEFAULT_POOL_SIZE);
    }
}
