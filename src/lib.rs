//! Single-path filesystem change watcher.
//!
//! `watchfs` turns the native change-notification primitives of each
//! platform (FSEvents on Darwin, inotify + epoll on Linux) into one
//! normalized stream of [`Event`]s, delivered to a caller-supplied sink
//! until the caller releases a [`Liveness`] signal.
//!
//! # Architecture
//!
//! - **[`Event`] / [`Notice`]**: the normalized event model shared by all
//!   adapters, including the paired form for correlated renames.
//! - **[`Liveness`]**: a one-shot wait/release signal controlling the
//!   watch lifetime.
//! - **platform adapters**: translate kernel batches, manage recursive
//!   watches on Linux, and tear down safely on Darwin even when the OS
//!   fires a callback after the stream is released.
//! - **[`watch`]**: the single entry point, dispatching to the adapter for
//!   the platform it was compiled on.
//!
//! Diagnostics travel the same channel as data: failures surface as
//! `Watcher`-kind events whose `path` is a stable token (see
//! [`WatcherError`]), in addition to `watch` returning `false`.
//!
//! # Example
//!
//! ```no_run
//! use std::thread;
//!
//! use watchfs::{Liveness, Notice};
//!
//! let liveness = Liveness::new();
//! let watcher = {
//! 	let liveness = liveness.clone();
//! 	thread::spawn(move || {
//! 		watchfs::watch("/tmp/w", |notice: Notice| println!("{}", notice.primary()), &liveness)
//! 	})
//! };
//!
//! // ... later, from any thread:
//! liveness.release();
//! assert!(watcher.join().unwrap());
//! ```

mod error;
mod event;
mod liveness;
mod platform;

pub use error::WatcherError;
pub use event::{Effect, Event, EventHandler, Notice, PathKind};
pub use liveness::{Liveness, State};

use std::path::Path;

/// Watches `path` (a file or a directory tree), delivering normalized
/// events to `handler` until `liveness` is released.
///
/// Blocks the calling thread for the whole watch. Returns `true` only if
/// the liveness signal transitioned cleanly to released *and* adapter
/// teardown succeeded; setup failures and unrecoverable errors return
/// `false` after emitting a `Watcher`-kind diagnostic through the sink.
pub fn watch(path: impl AsRef<Path>, handler: impl EventHandler, liveness: &Liveness) -> bool {
	let mut handler = handler;
	platform::watch(path.as_ref(), &mut handler, liveness)
}
