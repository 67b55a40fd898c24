//! The inotify + epoll adapter.
//!
//! inotify is not recursive, so recursion is rebuilt in user space: the
//! initial tree walk installs a watch per directory, and the map of watch
//! descriptors to directory paths is updated as directories are created and
//! destroyed during the run. A directory can appear and fill up before its
//! watch lands; callers that need perfect fidelity rescan on `Create` of a
//! directory.
//!
//! The event loop is single-threaded and cooperative. `epoll_wait` is the
//! only suspension point, bounded so the liveness signal is re-checked
//! every few milliseconds.

use std::{
	collections::HashMap,
	ffi::{CString, OsStr},
	io, mem,
	os::unix::ffi::OsStrExt,
	path::{Path, PathBuf},
};

use tracing::{debug, error, trace, warn};
use walkdir::WalkDir;

use crate::{
	error::WatcherError,
	event::{Effect, Event, EventHandler, Notice, PathKind},
	liveness::Liveness,
};

/// How long `epoll_wait` may sleep before liveness is re-checked.
const DELAY_MS: libc::c_int = 16;
/// Ready-list capacity handed to `epoll_wait`. Anything we don't pick up
/// stays queued for the next call, so one slot is enough.
const EVENT_WAIT_QUEUE_MAX: usize = 1;
/// A page comfortably holds a batch of `inotify_event` records.
const EVENT_BUF_LEN: usize = 4096;
/// Everything we translate, plus overflow so drops can be reported.
const IN_WATCH_OPT: u32 =
	libc::IN_CREATE | libc::IN_MODIFY | libc::IN_DELETE | libc::IN_MOVED_FROM | libc::IN_Q_OVERFLOW;

/// The inotify and epoll descriptors for one `watch` invocation.
///
/// `valid` distinguishes a half-constructed record, where one of the
/// descriptors is still -1, from a usable one.
struct SysResource {
	valid: bool,
	watch_fd: libc::c_int,
	event_fd: libc::c_int,
}

/// Forward a failure to the sink and the log.
fn emit(handler: &mut dyn EventHandler, err: WatcherError) {
	if err.is_warning() {
		warn!("{err}");
	} else {
		error!("{err}");
	}
	handler.handle_event(Notice::One(err.to_event()));
}

/// Initializes inotify (non-blocking) and epoll (close-on-exec) and wires
/// the former into the latter. Failures are reported through the sink and
/// yield an invalid record carrying whatever descriptors were obtained.
fn open_resources(handler: &mut dyn EventHandler) -> SysResource {
	#[cfg(target_os = "android")]
	let watch_fd = unsafe { libc::inotify_init() };
	#[cfg(not(target_os = "android"))]
	let watch_fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK) };

	if watch_fd < 0 {
		emit(
			handler,
			WatcherError::InotifyInit {
				source: io::Error::last_os_error(),
			},
		);
		return SysResource {
			valid: false,
			watch_fd,
			event_fd: -1,
		};
	}

	#[cfg(target_os = "android")]
	let event_fd = unsafe { libc::epoll_create(EVENT_WAIT_QUEUE_MAX as libc::c_int) };
	#[cfg(not(target_os = "android"))]
	let event_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

	if event_fd < 0 {
		emit(
			handler,
			WatcherError::EpollCreate {
				source: io::Error::last_os_error(),
			},
		);
		return SysResource {
			valid: false,
			watch_fd,
			event_fd,
		};
	}

	let mut event_conf = libc::epoll_event {
		events: libc::EPOLLIN as u32,
		u64: watch_fd as u64,
	};
	if unsafe { libc::epoll_ctl(event_fd, libc::EPOLL_CTL_ADD, watch_fd, &mut event_conf) } < 0 {
		emit(
			handler,
			WatcherError::EpollCtl {
				source: io::Error::last_os_error(),
			},
		);
		return SysResource {
			valid: false,
			watch_fd,
			event_fd,
		};
	}

	SysResource {
		valid: true,
		watch_fd,
		event_fd,
	}
}

/// Closes whatever descriptors were obtained. A failed close is reported
/// but cannot be recovered from.
fn close_resources(sr: &SysResource, base: &Path, handler: &mut dyn EventHandler) -> bool {
	let mut ok = true;
	for fd in [sr.watch_fd, sr.event_fd] {
		if fd >= 0 && unsafe { libc::close(fd) } != 0 {
			emit(
				handler,
				WatcherError::Close {
					base: base.to_owned(),
					source: io::Error::last_os_error(),
				},
			);
			ok = false;
		}
	}
	ok
}

/// Adds a kernel watch on `dir` and records it in the map. `None` means the
/// kernel refused the watch; the map is untouched.
fn add_watch(
	watch_fd: libc::c_int,
	dir: &Path,
	map: &mut HashMap<libc::c_int, PathBuf>,
) -> Option<libc::c_int> {
	let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
	let wd = unsafe { libc::inotify_add_watch(watch_fd, c_path.as_ptr(), IN_WATCH_OPT) };
	if wd > 0 {
		trace!("watching {} (wd {wd})", dir.display());
		map.insert(wd, dir.to_path_buf());
		Some(wd)
	} else {
		None
	}
}

/// Builds the initial watch-descriptor map: the base path itself and, when
/// the base is a directory, every directory below it, following symlinks
/// and skipping entries we lack permission for. Subdirectories the kernel
/// refuses are reported and skipped; an unwatchable base yields an empty
/// map.
fn build_watch_map(
	base: &Path,
	handler: &mut dyn EventHandler,
	sr: &SysResource,
) -> HashMap<libc::c_int, PathBuf> {
	let mut map = HashMap::new();
	if !sr.valid {
		return map;
	}
	if add_watch(sr.watch_fd, base, &mut map).is_none() {
		return map;
	}
	if base.is_dir() {
		for entry in WalkDir::new(base)
			.follow_links(true)
			.min_depth(1)
			.into_iter()
			.filter_map(|entry| entry.ok())
		{
			if entry.file_type().is_dir() && add_watch(sr.watch_fd, entry.path(), &mut map).is_none()
			{
				emit(
					handler,
					WatcherError::NotWatched {
						base: base.to_owned(),
						dir: entry.path().to_owned(),
					},
				);
			}
		}
	}
	map
}

/// Translates one batch of packed `inotify_event` records.
///
/// Records are variable-length: the next one begins at the current record's
/// base plus the header plus the declared name length. The declared length
/// is the only safe stride; anything fixed desynchronizes on the first name
/// that differs from it.
fn process_batch(
	buf: &[u8],
	watch_fd: libc::c_int,
	map: &mut HashMap<libc::c_int, PathBuf>,
	base: &Path,
	handler: &mut dyn EventHandler,
) {
	const HEADER_LEN: usize = mem::size_of::<libc::inotify_event>();

	let mut offset = 0;
	while offset + HEADER_LEN <= buf.len() {
		// Safety: the kernel writes whole records, and `offset` stays on
		// the 4-byte grid the buffer was aligned to.
		let record = unsafe { &*(buf.as_ptr().add(offset) as *const libc::inotify_event) };
		let mask = record.mask;
		let wd = record.wd;
		let name_len = record.len as usize;
		let name_bytes = &buf[offset + HEADER_LEN..(offset + HEADER_LEN + name_len).min(buf.len())];
		offset += HEADER_LEN + name_len;

		if mask & libc::IN_Q_OVERFLOW != 0 {
			emit(
				handler,
				WatcherError::Overflow {
					base: base.to_owned(),
				},
			);
			continue;
		}

		let Some(parent) = map.get(&wd) else {
			// A watch we already detached can have records still queued.
			trace!("dropping record for unknown wd {wd}");
			continue;
		};

		// The name is NUL-padded out to the declared length.
		let name_end = name_bytes
			.iter()
			.position(|&byte| byte == 0)
			.unwrap_or(name_bytes.len());
		let path = if name_end == 0 {
			parent.clone()
		} else {
			parent.join(OsStr::from_bytes(&name_bytes[..name_end]))
		};

		let path_kind = if mask & libc::IN_ISDIR != 0 {
			PathKind::Directory
		} else {
			PathKind::File
		};
		let effect = if mask & libc::IN_CREATE != 0 {
			Effect::Create
		} else if mask & libc::IN_DELETE != 0 {
			Effect::Destroy
		} else if mask & libc::IN_MOVE != 0 {
			Effect::Rename
		} else if mask & libc::IN_MODIFY != 0 {
			Effect::Modify
		} else {
			Effect::Other
		};

		trace!("{} {effect} {path_kind}", path.display());
		handler.handle_event(Notice::One(Event::new(path.clone(), effect, path_kind)));

		if path_kind == PathKind::Directory && effect == Effect::Create {
			if add_watch(watch_fd, &path, map).is_none() {
				emit(
					handler,
					WatcherError::NotWatched {
						base: base.to_owned(),
						dir: path,
					},
				);
			}
		} else if path_kind == PathKind::Directory && effect == Effect::Destroy {
			unsafe { libc::inotify_rm_watch(watch_fd, wd) };
			map.remove(&wd);
		}
	}
}

/// Reads the inotify descriptor dry. Returns `false` only on a read error;
/// "nothing left" is the expected way out.
fn drain(
	watch_fd: libc::c_int,
	map: &mut HashMap<libc::c_int, PathBuf>,
	base: &Path,
	handler: &mut dyn EventHandler,
) -> bool {
	#[repr(align(4))]
	struct AlignedBuf([u8; EVENT_BUF_LEN]);

	let mut buf = AlignedBuf([0; EVENT_BUF_LEN]);
	loop {
		let len = unsafe { libc::read(watch_fd, buf.0.as_mut_ptr().cast(), EVENT_BUF_LEN) };
		if len > 0 {
			process_batch(&buf.0[..len as usize], watch_fd, map, base, handler);
			continue;
		}
		if len == 0 {
			return true;
		}
		let err = io::Error::last_os_error();
		if err.kind() == io::ErrorKind::WouldBlock {
			return true;
		}
		emit(
			handler,
			WatcherError::Read {
				base: base.to_owned(),
				source: err,
			},
		);
		return false;
	}
}

pub(crate) fn watch(path: &Path, handler: &mut dyn EventHandler, liveness: &Liveness) -> bool {
	let sr = open_resources(handler);
	let mut map = build_watch_map(path, handler, &sr);

	if !sr.valid {
		emit(
			handler,
			WatcherError::SysResource {
				base: path.to_owned(),
			},
		);
		close_resources(&sr, path, handler);
		return false;
	}
	if map.is_empty() {
		emit(
			handler,
			WatcherError::PathMap {
				base: path.to_owned(),
			},
		);
		close_resources(&sr, path, handler);
		return false;
	}

	debug!("watching {} with {} initial watch(es)", path.display(), map.len());

	while !liveness.is_released() {
		let mut ready = [libc::epoll_event { events: 0, u64: 0 }; EVENT_WAIT_QUEUE_MAX];
		let count = unsafe {
			libc::epoll_wait(
				sr.event_fd,
				ready.as_mut_ptr(),
				EVENT_WAIT_QUEUE_MAX as libc::c_int,
				DELAY_MS,
			)
		};

		if count < 0 {
			emit(
				handler,
				WatcherError::EpollWait {
					base: path.to_owned(),
					source: io::Error::last_os_error(),
				},
			);
			close_resources(&sr, path, handler);
			return false;
		}

		for ready_event in &ready[..count as usize] {
			if ready_event.u64 == sr.watch_fd as u64
				&& !drain(sr.watch_fd, &mut map, path, handler)
			{
				emit(
					handler,
					WatcherError::EventRecv {
						base: path.to_owned(),
					},
				);
				close_resources(&sr, path, handler);
				return false;
			}
		}
	}

	debug!("stopped watching {}", path.display());
	close_resources(&sr, path, handler)
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use super::*;

	#[derive(Clone, Default)]
	struct Log(Arc<Mutex<Vec<Notice>>>);

	impl Log {
		fn sink(&self) -> impl FnMut(Notice) + Send {
			let log = self.0.clone();
			move |notice| log.lock().unwrap().push(notice)
		}

		fn events(&self) -> Vec<Event> {
			self.0
				.lock()
				.unwrap()
				.iter()
				.map(|notice| notice.primary().clone())
				.collect()
		}
	}

	/// One packed inotify record, padded the way the kernel pads names.
	fn record(wd: i32, mask: u32, name: &str, pad: usize) -> Vec<u8> {
		let name_len = name.len() + pad;
		let mut buf = Vec::new();
		buf.extend_from_slice(&wd.to_ne_bytes());
		buf.extend_from_slice(&mask.to_ne_bytes());
		buf.extend_from_slice(&0u32.to_ne_bytes()); // cookie
		buf.extend_from_slice(&(name_len as u32).to_ne_bytes());
		buf.extend_from_slice(name.as_bytes());
		buf.resize(buf.len() + pad, 0);
		buf
	}

	/// Records land in an `inotify_event`-aligned buffer, as they do when
	/// the kernel writes them.
	#[repr(align(4))]
	struct Staged([u8; EVENT_BUF_LEN]);

	fn stage(records: &[Vec<u8>]) -> (Staged, usize) {
		let raw = records.concat();
		let mut staged = Staged([0; EVENT_BUF_LEN]);
		staged.0[..raw.len()].copy_from_slice(&raw);
		(staged, raw.len())
	}

	#[test]
	fn batch_iteration_honors_record_lengths() {
		let log = Log::default();
		let mut map = HashMap::from([(1, PathBuf::from("/tmp/w"))]);

		// Different name lengths per record; a fixed stride would
		// desynchronize on the second one.
		let (buf, len) = stage(&[
			record(1, libc::IN_CREATE, "a", 3),
			record(1, libc::IN_MODIFY, "somewhat-longer.txt", 1),
			record(1, libc::IN_MOVED_FROM, "gone", 8),
		]);

		let mut sink = log.sink();
		process_batch(&buf.0[..len], -1, &mut map, Path::new("/tmp/w"), &mut sink);

		let events = log.events();
		assert_eq!(events.len(), 3);
		assert_eq!(events[0].path, PathBuf::from("/tmp/w/a"));
		assert_eq!(events[0].effect, Effect::Create);
		assert_eq!(events[1].path, PathBuf::from("/tmp/w/somewhat-longer.txt"));
		assert_eq!(events[1].effect, Effect::Modify);
		assert_eq!(events[2].path, PathBuf::from("/tmp/w/gone"));
		assert_eq!(events[2].effect, Effect::Rename);
		assert!(events.iter().all(|event| event.path_kind == PathKind::File));
	}

	#[test]
	fn overflow_records_become_diagnostics() {
		let log = Log::default();
		let mut map = HashMap::from([(1, PathBuf::from("/tmp/w"))]);

		let (buf, len) = stage(&[record(-1, libc::IN_Q_OVERFLOW, "", 0)]);
		let mut sink = log.sink();
		process_batch(&buf.0[..len], -1, &mut map, Path::new("/tmp/w"), &mut sink);

		let events = log.events();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].path_kind, PathKind::Watcher);
		assert_eq!(events[0].path, PathBuf::from("e/self/overflow@/tmp/w"));
	}

	#[test]
	fn records_for_unknown_descriptors_are_dropped() {
		let log = Log::default();
		let mut map: HashMap<libc::c_int, PathBuf> = HashMap::new();

		let (buf, len) = stage(&[record(7, libc::IN_CREATE, "orphan", 2)]);
		let mut sink = log.sink();
		process_batch(&buf.0[..len], -1, &mut map, Path::new("/tmp/w"), &mut sink);

		assert!(log.events().is_empty());
	}

	#[test]
	fn nameless_records_resolve_to_the_watched_directory() {
		let log = Log::default();
		let mut map = HashMap::from([(3, PathBuf::from("/tmp/w/sub"))]);

		let (buf, len) = stage(&[record(3, libc::IN_MODIFY, "", 0)]);
		let mut sink = log.sink();
		process_batch(&buf.0[..len], -1, &mut map, Path::new("/tmp/w"), &mut sink);

		let events = log.events();
		assert_eq!(events[0].path, PathBuf::from("/tmp/w/sub"));
		assert_eq!(events[0].effect, Effect::Modify);
	}

	#[test]
	fn initial_map_covers_the_tree() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
		std::fs::create_dir(dir.path().join("c")).unwrap();

		let log = Log::default();
		let mut sink = log.sink();
		let sr = open_resources(&mut sink);
		assert!(sr.valid);

		let map = build_watch_map(dir.path(), &mut sink, &sr);
		let watched: Vec<_> = map.values().cloned().collect();
		assert_eq!(map.len(), 4);
		for sub in ["a", "a/b", "c"] {
			assert!(watched.contains(&dir.path().join(sub)), "missing {sub}");
		}
		assert!(watched.contains(&dir.path().to_path_buf()));

		assert!(close_resources(&sr, dir.path(), &mut sink));
		assert!(log.events().is_empty());
	}

	#[test]
	fn unwatchable_base_yields_an_empty_map() {
		let log = Log::default();
		let mut sink = log.sink();
		let sr = open_resources(&mut sink);
		let map = build_watch_map(Path::new("/nonexistent/watchfs-test"), &mut sink, &sr);
		assert!(map.is_empty());
		close_resources(&sr, Path::new("/nonexistent/watchfs-test"), &mut sink);
	}
}
