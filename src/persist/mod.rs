//! On-disk primitives: atomic writes and lock files.

pub mod atomic;
pub mod lock;

pub use atomic::{read_json, write, write_json};
pub use lock::{LockGuard, LockOptions, acquire, lock_path_for};
