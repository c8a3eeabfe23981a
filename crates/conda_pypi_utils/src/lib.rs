mod atomic_write;
pub mod reqwest;

pub use atomic_write::{atomic_write, atomic_write_sync};
