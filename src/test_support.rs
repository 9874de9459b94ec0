use std::sync::Mutex;

// Tests that touch ATOM_* environment variables must serialize on this lock;
// the test binary runs them on multiple threads.
static ENV_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
}
