mod chdir;
mod exec;
mod gil;
mod io;
mod job_group;

pub mod prelude {
    use crate::proc::proc_init;
    use crate::signal::signal_set_handlers;
    use once_cell::sync::OnceCell;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub use serial_test::serial;

    /// Initialize the subsystems that tests exercising the scheduler need: the IO thread pool,
    /// the per-thread status holder (which must register its observer before any execution thread
    /// is spawned), and our signal handlers.
    pub fn test_init() {
        static DONE: OnceCell<()> = OnceCell::new();
        DONE.get_or_init(|| {
            crate::threads::init();
            proc_init();
            signal_set_handlers();
        });
    }

    /// Create a fresh directory under the system temp dir and return its path.
    /// Tests clean these up themselves; leaking one on test failure is harmless.
    pub fn make_test_dir(name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "fish_exec_test_{}_{}_{}",
            name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
