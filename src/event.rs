//! Normalized filesystem events.
//!
//! Both platform adapters translate their native notification records into
//! this one model before anything reaches the caller. The goal is that an
//! event means the same thing no matter which kernel produced it.

use std::{fmt, path::PathBuf, time::SystemTime};

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
	Create,
	Modify,
	Destroy,
	Rename,
	Other,
}

/// What the path is.
///
/// `Watcher` is reserved for events the adapter synthesizes about itself
/// (setup failures, queue overflow, unwatchable subdirectories). For those,
/// [`Event::path`] carries a stable diagnostic token rather than a user
/// filesystem path. `HardLink` covers both the "is hard link" and "is last
/// hard link" notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
	File,
	Directory,
	SymLink,
	HardLink,
	Watcher,
	Other,
}

/// A single filesystem change, never mutated after construction.
///
/// `path` may be empty when the kernel reports an event without one.
#[derive(Debug, Clone)]
pub struct Event {
	pub path: PathBuf,
	pub effect: Effect,
	pub path_kind: PathKind,
	/// When the adapter built this event, not when the kernel saw the
	/// change. Not part of event identity; deduplication and tests compare
	/// `(path, effect, path_kind)`.
	pub time: SystemTime,
}

impl Event {
	pub fn new(path: impl Into<PathBuf>, effect: Effect, path_kind: PathKind) -> Self {
		Self {
			path: path.into(),
			effect,
			path_kind,
			time: SystemTime::now(),
		}
	}

	/// An adapter-synthesized diagnostic. `token` is one of the stable
	/// strings documented on [`crate::WatcherError`].
	pub(crate) fn watcher(token: String) -> Self {
		Self::new(token, Effect::Other, PathKind::Watcher)
	}

	/// True for events whose `path` is a diagnostic token.
	pub fn is_diagnostic(&self) -> bool {
		self.path_kind == PathKind::Watcher
	}
}

/// What one sink call receives: a lone event, or both halves of a
/// correlated non-destructive rename.
#[derive(Debug, Clone)]
pub enum Notice {
	One(Event),
	Rename { from: Event, to: Event },
}

impl Notice {
	/// The event that best identifies this notice; for renames, the
	/// destination side.
	pub fn primary(&self) -> &Event {
		match self {
			Notice::One(event) => event,
			Notice::Rename { to, .. } => to,
		}
	}
}

/// The caller-supplied sink.
///
/// Within one `watch` invocation the library never invokes the handler
/// concurrently with itself: callbacks are serialized on a dispatch queue
/// on Darwin and the Linux event loop is single-threaded. Slow handlers
/// degrade latency; events are only lost once the kernel-side queue
/// overflows.
pub trait EventHandler: Send {
	/// Handles a notice.
	fn handle_event(&mut self, notice: Notice);
}

impl<F> EventHandler for F
where
	F: FnMut(Notice) + Send,
{
	fn handle_event(&mut self, notice: Notice) {
		(self)(notice);
	}
}

impl fmt::Display for Effect {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Effect::Create => "create",
			Effect::Modify => "modify",
			Effect::Destroy => "destroy",
			Effect::Rename => "rename",
			Effect::Other => "other",
		})
	}
}

impl fmt::Display for PathKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			PathKind::File => "file",
			PathKind::Directory => "dir",
			PathKind::SymLink => "sym_link",
			PathKind::HardLink => "hard_link",
			PathKind::Watcher => "watcher",
			PathKind::Other => "other",
		})
	}
}

impl fmt::Display for Event {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {} {}", self.path.display(), self.effect, self.path_kind)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn diagnostic_events_carry_watcher_kind() {
		let event = Event::watcher("e/self/path_map@/tmp/w".to_owned());
		assert!(event.is_diagnostic());
		assert_eq!(event.effect, Effect::Other);
		assert_eq!(event.path_kind, PathKind::Watcher);
		assert_eq!(event.path, PathBuf::from("e/self/path_map@/tmp/w"));
	}

	#[test]
	fn user_events_are_not_diagnostics() {
		let event = Event::new("/tmp/w/a", Effect::Create, PathKind::File);
		assert!(!event.is_diagnostic());
	}

	#[test]
	fn rename_notice_primary_is_destination() {
		let notice = Notice::Rename {
			from: Event::new("/tmp/w/c", Effect::Rename, PathKind::File),
			to: Event::new("/tmp/w/d", Effect::Rename, PathKind::File),
		};
		assert_eq!(notice.primary().path, PathBuf::from("/tmp/w/d"));
	}

	#[test]
	fn closures_are_handlers() {
		let mut seen = Vec::new();
		{
			let mut handler = |notice: Notice| seen.push(notice);
			handler.handle_event(Notice::One(Event::new(
				"/tmp/w/a",
				Effect::Modify,
				PathKind::File,
			)));
		}
		assert_eq!(seen.len(), 1);
	}

	#[test]
	fn display_is_terse() {
		let event = Event::new("/tmp/w/a", Effect::Create, PathKind::File);
		assert_eq!(event.to_string(), "/tmp/w/a create file");
	}
}
