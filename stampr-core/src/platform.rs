//! Provides platform-specific functionality.
//!
//! stampr only runs on Linux: it relies on sysfs for hardware descriptors and
//! on the kernel's block-device ioctls. The module is kept separate so the
//! rest of the library never touches `/sys` or raw file descriptors directly.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
