use tokio::sync::Mutex;

use crate::engine::Engine;

/// Single-permit access to a non re-entrant engine.
///
/// Waiters are served in FIFO order. Must be entered from blocking threads
/// (`spawn_blocking` or plain threads), never from async tasks.
pub struct EngineGate {
    engine: Mutex<Box<dyn Engine>>,
}

impl EngineGate {
    pub fn new(engine: impl Engine + 'static) -> Self {
        Self::from_boxed(Box::new(engine))
    }

    pub fn from_boxed(engine: Box<dyn Engine>) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Runs `f` with exclusive access; the permit is returned when `f` exits, even by panic.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn Engine) -> R) -> R {
        let mut engine = self.engine.blocking_lock();
        f(&mut **engine)
    }
}
