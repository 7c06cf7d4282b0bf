//! Query hook middleware.
//!
//! Hooks run as ordered chains around execution: before-hooks see the SQL
//! after the length gate and before parsing, and may rewrite or reject it;
//! after-hooks see the collected result before the transaction commits
//! (write paths) or after the rollback (read paths), and may mutate or
//! reject it. Any failure stops the chain and becomes the pipeline's error.
//!
//! Two transports exist and are mutually exclusive per gateway:
//! in-process typed callbacks ([`native`]) and out-of-process commands
//! exchanging JSON over standard streams ([`subprocess`]).

pub mod native;
pub mod subprocess;

pub use native::{AfterHookFn, BeforeHookFn, NativeHook, NativeHookRunner};
pub use subprocess::{SubprocessHook, SubprocessHookRunner};
