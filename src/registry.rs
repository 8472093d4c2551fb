use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use log::debug;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

/// Held from a successful ANNOUNCE until teardown.
pub type SessionGuard = OwnedMutexGuard<()>;
/// Held by the one worker driving the audio output.
pub type PlayerGuard = OwnedMutexGuard<()>;

#[derive(Clone)]
struct Holder {
    id: u32,
    wake: Arc<Notify>,
}

/// The two locks, the process-wide shutdown flag and the identity of the
/// worker bound to the audio output. One instance is shared by the acceptor
/// and every connection worker.
///
/// Invariant: the session lock and the player lock are only ever held
/// together by the same worker.
pub struct SessionRegistry {
    session: Arc<AsyncMutex<()>>,
    player: Arc<AsyncMutex<()>>,
    shutdown: AtomicBool,
    session_holder: Mutex<Option<Holder>>,
    player_holder: Mutex<Option<Holder>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            session: Arc::new(AsyncMutex::new(())),
            player: Arc::new(AsyncMutex::new(())),
            shutdown: AtomicBool::new(false),
            session_holder: Mutex::new(None),
            player_holder: Mutex::new(None),
        }
    }

    /// Conditionally enters the announce-to-teardown window. With `preempt`
    /// set (session timeout of zero) a holder is told to shut down and the
    /// call waits for it to unwind; otherwise contention returns `None`.
    pub async fn acquire_session(&self, id: u32, wake: &Arc<Notify>, preempt: bool) -> Option<SessionGuard> {
        let guard = match self.session.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) if preempt => {
                debug!("connection {} pre-empting the current source", id);
                self.request_shutdown();
                let guard = self.session.clone().lock_owned().await;
                // the evicted holder is past its flag check once the lock
                // frees up; reset it so the request is not read as our own
                self.clear_shutdown();
                guard
            }
            Err(_) => return None,
        };

        *self.session_holder.lock().unwrap() = Some(Holder { id, wake: wake.clone() });

        Some(guard)
    }

    pub fn release_session(&self, id: u32) {
        let mut holder = self.session_holder.lock().unwrap();
        if matches!(&*holder, Some(x) if x.id == id) {
            *holder = None;
        }
    }

    /// Claims the audio output, evicting the current owner if there is one.
    /// Callers already holding their player guard must not call this again.
    pub async fn take_player(&self, id: u32, wake: &Arc<Notify>) -> PlayerGuard {
        let guard = match self.player.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("shutting down the playing worker");
                self.request_shutdown();
                let guard = self.player.clone().lock_owned().await;
                self.clear_shutdown();
                guard
            }
        };

        *self.player_holder.lock().unwrap() = Some(Holder { id, wake: wake.clone() });

        guard
    }

    pub fn release_player(&self, id: u32) {
        let mut holder = self.player_holder.lock().unwrap();
        if matches!(&*holder, Some(x) if x.id == id) {
            *holder = None;
        }
    }

    /// Optimistic "is it me" check on the playing identity; never used to
    /// claim anything.
    pub fn is_playing(&self, id: u32) -> bool {
        matches!(&*self.player_holder.lock().unwrap(), Some(x) if x.id == id)
    }

    /// Raises the shutdown flag and interrupts the lock holders blocked in
    /// their reads. The flag is cleared twice on the pre-emption path, by
    /// the unwinding holder before it releases its locks and by the waiter
    /// after it acquires them, so a pre-empting worker never reads its own
    /// request as an eviction.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        for holder in [&self.session_holder, &self.player_holder] {
            if let Some(holder) = holder.lock().unwrap().clone() {
                holder.wake.notify_one();
            }
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn clear_shutdown(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
