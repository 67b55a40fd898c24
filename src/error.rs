//! Failure taxonomy and the stable diagnostic tokens.
//!
//! The sink is the unified channel for data and diagnostics: every failure
//! here is also delivered to the caller as a `Watcher`-kind [`Event`] whose
//! `path` field carries the variant's token. Callers match on the token
//! prefix (`e/sys/`, `e/self/`, `w/sys/`); a caller that ignores
//! `Watcher`-kind events observes silence during a failure.

use std::{io, path::PathBuf};

use crate::event::Event;

/// Everything that can go wrong while watching.
///
/// `e/…` variants are errors; the `e/self/…` ones are failures of the
/// watcher itself rather than of a named syscall. `w/…` variants are
/// warnings and never stop the watcher. Nothing is retried automatically:
/// queue overflow in particular means the kernel has already dropped
/// events, so the only honest move is to tell the caller and keep going.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
	#[error("failed to initialize inotify: {source}")]
	InotifyInit { source: io::Error },

	#[error("failed to create epoll instance: {source}")]
	EpollCreate { source: io::Error },

	#[error("failed to register inotify descriptor with epoll: {source}")]
	EpollCtl { source: io::Error },

	#[error("epoll_wait failed for {}: {source}", base.display())]
	EpollWait { base: PathBuf, source: io::Error },

	#[error("read on the inotify descriptor failed for {}: {source}", base.display())]
	Read { base: PathBuf, source: io::Error },

	#[error("closing a watch resource failed for {}: {source}", base.display())]
	Close { base: PathBuf, source: io::Error },

	#[error("system resources could not be initialized for {}", base.display())]
	SysResource { base: PathBuf },

	#[error("no watchable paths under {}", base.display())]
	PathMap { base: PathBuf },

	#[error("event drain failed for {}", base.display())]
	EventRecv { base: PathBuf },

	#[error("inotify queue overflowed for {}; events were dropped", base.display())]
	Overflow { base: PathBuf },

	#[error("could not watch {} under {}; continuing", dir.display(), base.display())]
	NotWatched { base: PathBuf, dir: PathBuf },
}

impl WatcherError {
	/// The stable token delivered as the `path` of the diagnostic event.
	pub fn token(&self) -> String {
		match self {
			WatcherError::InotifyInit { .. } => "e/sys/inotify_init".to_owned(),
			WatcherError::EpollCreate { .. } => "e/sys/epoll_create".to_owned(),
			WatcherError::EpollCtl { .. } => "e/sys/epoll_ctl".to_owned(),
			WatcherError::EpollWait { base, .. } => {
				format!("e/sys/epoll_wait@{}", base.display())
			}
			WatcherError::Read { base, .. } => format!("e/sys/read@{}", base.display()),
			WatcherError::Close { base, .. } => format!("e/sys/close@{}", base.display()),
			WatcherError::SysResource { base } => {
				format!("e/self/sys_resource@{}", base.display())
			}
			WatcherError::PathMap { base } => format!("e/self/path_map@{}", base.display()),
			WatcherError::EventRecv { base } => {
				format!("e/self/event_recv@{}", base.display())
			}
			WatcherError::Overflow { base } => format!("e/self/overflow@{}", base.display()),
			WatcherError::NotWatched { base, dir } => {
				format!("w/sys/not_watched@{}@{}", base.display(), dir.display())
			}
		}
	}

	/// True for conditions the watcher reports and survives.
	pub fn is_warning(&self) -> bool {
		matches!(
			self,
			WatcherError::NotWatched { .. } | WatcherError::Overflow { .. }
		)
	}

	/// The diagnostic event this failure surfaces as.
	pub fn to_event(&self) -> Event {
		Event::watcher(self.token())
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;
	use crate::event::PathKind;

	fn base() -> PathBuf {
		PathBuf::from("/tmp/w")
	}

	#[test]
	fn bare_tokens_have_no_base() {
		let err = WatcherError::InotifyInit {
			source: io::Error::from_raw_os_error(libc::EMFILE),
		};
		assert_eq!(err.token(), "e/sys/inotify_init");
	}

	#[test]
	fn based_tokens_append_the_base_path() {
		assert_eq!(
			WatcherError::Overflow { base: base() }.token(),
			"e/self/overflow@/tmp/w"
		);
		assert_eq!(
			WatcherError::PathMap { base: base() }.token(),
			"e/self/path_map@/tmp/w"
		);
	}

	#[test]
	fn not_watched_names_both_paths() {
		let err = WatcherError::NotWatched {
			base: base(),
			dir: PathBuf::from("/tmp/w/sub"),
		};
		assert_eq!(err.token(), "w/sys/not_watched@/tmp/w@/tmp/w/sub");
		assert!(err.is_warning());
	}

	#[test]
	fn diagnostic_events_are_watcher_kind() {
		let event = WatcherError::EventRecv { base: base() }.to_event();
		assert_eq!(event.path_kind, PathKind::Watcher);
		assert_eq!(event.path, PathBuf::from("e/self/event_recv@/tmp/w"));
	}
}
