//! The Darwin FSEvents adapter.
//!
//! The stream is bound to the global default-priority dispatch queue, so
//! callbacks are serialized with respect to each other and the sink is
//! never re-entered. The hard part is teardown: under heavy load the
//! system occasionally delivers one more callback after
//! `FSEventStreamRelease`. Shared ownership of the callback context, a
//! validity mutex, and paired owner/borrower flags were all tried upstream
//! and all lose the same way, because the callback reads memory that no
//! longer exists. What works is keeping the context on the `watch` stack
//! frame, so it outlives the stream, and sleeping briefly after release so
//! a straggler still finds it; the callback additionally treats a partial
//! context as "do nothing".

use std::{
	collections::HashSet,
	ffi::{c_void, CStr},
	panic::{catch_unwind, AssertUnwindSafe},
	path::{Path, PathBuf},
	ptr,
	sync::{Mutex, PoisonError},
};

use bitflags::bitflags;
use core_foundation_sys::{
	array::{CFArrayGetValueAtIndex, CFArrayRef},
	base::CFIndex,
	dictionary::{CFDictionaryGetValue, CFDictionaryRef},
	string::{kCFStringEncodingUTF8, CFStringGetCStringPtr, CFStringRef},
};
use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use tracing::{debug, trace};

use crate::{
	event::{Effect, Event, EventHandler, Notice, PathKind},
	liveness::{Liveness, State},
};

/// Seconds FSEvents may batch changes after a period of inactivity.
const STREAM_LATENCY_S: cf::CFTimeInterval = 0.016;

/// FSEvents surface that `fsevent-sys` does not bind.
#[allow(non_upper_case_globals, non_camel_case_types)]
mod ffi {
	use std::ffi::c_void;

	use core_foundation_sys::string::CFStringRef;
	use fsevent_sys as fs;

	pub type dispatch_queue_t = *mut c_void;

	pub const DISPATCH_QUEUE_PRIORITY_DEFAULT: libc::c_long = 0;
	pub const kFSEventStreamCreateFlagUseCFTypes: fs::FSEventStreamCreateFlags = 0x0000_0001;
	pub const kFSEventStreamCreateFlagUseExtendedData: fs::FSEventStreamCreateFlags = 0x0000_0040;

	#[link(name = "CoreServices", kind = "framework")]
	extern "C" {
		pub static kFSEventStreamEventExtendedDataPathKey: CFStringRef;

		pub fn FSEventStreamSetDispatchQueue(
			stream: fs::FSEventStreamRef,
			queue: dispatch_queue_t,
		);
		pub fn FSEventStreamFlushSync(stream: fs::FSEventStreamRef);
	}

	extern "C" {
		pub fn dispatch_get_global_queue(
			identifier: libc::c_long,
			flags: libc::c_ulong,
		) -> dispatch_queue_t;
	}
}

bitflags! {
	/// The per-event flags the adapter understands.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct StreamFlags: u32 {
		const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
		const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
		const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
		const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
		const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
		const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
		const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
		const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
		const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
		const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
		const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
		const IS_HARDLINK = fs::kFSEventStreamEventFlagItemIsHardlink;
		const IS_LAST_HARDLINK = fs::kFSEventStreamEventFlagItemIsLastHardlink;

		/// Anything we report as a modification.
		const EFFECT_MODIFY = Self::ITEM_MODIFIED.bits()
			| Self::INODE_META_MOD.bits()
			| Self::FINDER_INFO_MOD.bits()
			| Self::ITEM_CHANGE_OWNER.bits()
			| Self::ITEM_XATTR_MOD.bits();
		/// Any effect at all; without one of these we report `Other`.
		const EFFECT_ANY = Self::ITEM_CREATED.bits()
			| Self::ITEM_REMOVED.bits()
			| Self::EFFECT_MODIFY.bits()
			| Self::ITEM_RENAMED.bits();
		const IS_ANY_HARDLINK = Self::IS_HARDLINK.bits() | Self::IS_LAST_HARDLINK.bits();
	}
}

/// Callback context, shared with the OS for the stream's lifetime.
///
/// Lives on the `watch` stack frame; see the module notes on why nothing
/// fancier survives contact with FSEvents. The seen-created set suppresses
/// duplicate creates the OS re-sends in later batches and validates
/// destroys; the rename slot holds the "from" side of a rename until its
/// "to" side shows up.
struct StreamCtx<'a> {
	handler: Mutex<&'a mut dyn EventHandler>,
	seen_created: Mutex<HashSet<String>>,
	last_rename_from: Mutex<Option<PathBuf>>,
}

impl StreamCtx<'_> {
	fn send(&self, notice: Notice) {
		let mut handler = self
			.handler
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		handler.handle_event(notice);
	}
}

/// Walks array -> dictionary -> extended-data path -> UTF-8 C string.
/// Darwin should never hand us a null at any step; if it lies, the event
/// gets an empty path instead of a crash.
unsafe fn path_from_event_at(paths: *mut c_void, index: usize) -> PathBuf {
	let array = paths as CFArrayRef;
	let dict = CFArrayGetValueAtIndex(array, index as CFIndex) as CFDictionaryRef;
	if dict.is_null() {
		return PathBuf::new();
	}
	let value = CFDictionaryGetValue(
		dict,
		ffi::kFSEventStreamEventExtendedDataPathKey.cast(),
	);
	if value.is_null() {
		return PathBuf::new();
	}
	let c_str = CFStringGetCStringPtr(value as CFStringRef, kCFStringEncodingUTF8);
	if c_str.is_null() {
		return PathBuf::new();
	}
	match CStr::from_ptr(c_str).to_str() {
		Ok(path) => PathBuf::from(path),
		Err(_) => PathBuf::new(),
	}
}

/// Translates the flags of one event into zero or more notices.
///
/// More than one effect can have happened to the same path, so the effect
/// tests are non-exclusive, in the fixed order create, destroy, modify,
/// rename.
fn translate(ctx: &StreamCtx<'_>, path: PathBuf, flags: StreamFlags) {
	let path_kind = if flags.contains(StreamFlags::IS_FILE) {
		PathKind::File
	} else if flags.contains(StreamFlags::IS_DIR) {
		PathKind::Directory
	} else if flags.contains(StreamFlags::IS_SYMLINK) {
		PathKind::SymLink
	} else if flags.intersects(StreamFlags::IS_ANY_HARDLINK) {
		PathKind::HardLink
	} else {
		PathKind::Other
	};

	// Odd events are still worth reporting, even with an empty path, but
	// everything below depends on a recognized effect.
	if !flags.intersects(StreamFlags::EFFECT_ANY) {
		ctx.send(Notice::One(Event::new(path, Effect::Other, path_kind)));
		return;
	}

	if flags.contains(StreamFlags::ITEM_CREATED) {
		// The OS re-sends create flags when it batches an old create with
		// newer events; only the first sighting is forwarded.
		let mut seen = ctx
			.seen_created
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if seen.insert(path.to_string_lossy().into_owned()) {
			drop(seen);
			ctx.send(Notice::One(Event::new(
				path.clone(),
				Effect::Create,
				path_kind,
			)));
		}
	}
	if flags.contains(StreamFlags::ITEM_REMOVED) {
		// Only paths we announced as created can be announced as
		// destroyed; this is the other half of the duplicate-batch filter.
		let mut seen = ctx
			.seen_created
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if seen.remove(path.to_string_lossy().as_ref()) {
			drop(seen);
			ctx.send(Notice::One(Event::new(
				path.clone(),
				Effect::Destroy,
				path_kind,
			)));
		}
	}
	if flags.intersects(StreamFlags::EFFECT_MODIFY) {
		ctx.send(Notice::One(Event::new(
			path.clone(),
			Effect::Modify,
			path_kind,
		)));
	}
	if flags.contains(StreamFlags::ITEM_RENAMED) {
		// Non-destructive renames usually arrive as two events, from-path
		// first. Pair them when the stored path differs from the current
		// one and is gone from disk; intervening renames break the pattern
		// and fall back to re-arming the slot.
		let mut slot = ctx
			.last_rename_from
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		match slot.take() {
			Some(from) if from != path && !from.exists() => {
				drop(slot);
				ctx.send(Notice::Rename {
					from: Event::new(from, Effect::Rename, path_kind),
					to: Event::new(path, Effect::Rename, path_kind),
				});
			}
			_ => {
				*slot = Some(path);
			}
		}
	}
}

extern "C" fn event_recv(
	_stream: fs::FSEventStreamRef,
	info: *mut c_void,
	count: libc::size_t,
	paths: *mut c_void,
	flags: *const fs::FSEventStreamEventFlags,
	_ids: *const fs::FSEventStreamEventId,
) {
	// Near an exit the OS has been seen handing over a partial context;
	// treat anything null as "do nothing".
	if info.is_null() || paths.is_null() || flags.is_null() {
		return;
	}
	// Unwinding into FSEvents is undefined behavior, so nothing may panic
	// past this frame.
	let _ = catch_unwind(AssertUnwindSafe(|| {
		let ctx: &StreamCtx<'_> = unsafe { &*info.cast() };
		for index in 0..count {
			let path = unsafe { path_from_event_at(paths, index) };
			let flag = StreamFlags::from_bits_truncate(unsafe { *flags.add(index) });
			trace!("fsevents: {flag:?} {}", path.display());
			translate(ctx, path, flag);
		}
	}));
}

/// Requests a file event stream for `path`, binds it to `queue`, and
/// starts it. `None` means the stream could not be created; Darwin reports
/// per-event trouble through the stream itself, not here.
fn open_event_stream(
	path: &Path,
	queue: ffi::dispatch_queue_t,
	ctx: *mut c_void,
) -> Option<fs::FSEventStreamRef> {
	let Some(str_path) = path.to_str() else {
		return None;
	};

	let context = fs::FSEventStreamContext {
		version: 0,
		info: ctx,
		retain: None,
		release: None,
		copy_description: None,
	};

	let flags = fs::kFSEventStreamCreateFlagFileEvents
		| ffi::kFSEventStreamCreateFlagUseCFTypes
		| ffi::kFSEventStreamCreateFlagUseExtendedData;

	let stream = unsafe {
		let paths_array =
			cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
		let mut cf_err: cf::CFErrorRef = ptr::null_mut();
		let cf_path = cf::str_path_to_cfstring_ref(str_path, &mut cf_err);
		if cf_path.is_null() {
			cf::CFRelease(cf_err as cf::CFRef);
			cf::CFRelease(paths_array as cf::CFRef);
			return None;
		}
		cf::CFArrayAppendValue(paths_array, cf_path);
		cf::CFRelease(cf_path);

		let stream = fs::FSEventStreamCreate(
			cf::kCFAllocatorDefault,
			event_recv,
			&context,
			paths_array,
			fs::kFSEventStreamEventIdSinceNow,
			STREAM_LATENCY_S,
			flags,
		);
		// The stream retains its own copy of the paths.
		cf::CFRelease(paths_array as cf::CFRef);
		stream
	};

	if stream.is_null() || queue.is_null() || ctx.is_null() {
		return None;
	}

	unsafe {
		ffi::FSEventStreamSetDispatchQueue(stream, queue);
		fs::FSEventStreamStart(stream);
	}
	debug!("fsevents stream open for {}", path.display());
	Some(stream)
}

/// Flushes outstanding events, then stops, invalidates, and releases the
/// stream.
fn close_event_stream(stream: Option<fs::FSEventStreamRef>) -> bool {
	match stream {
		Some(stream) => {
			unsafe {
				ffi::FSEventStreamFlushSync(stream);
				fs::FSEventStreamStop(stream);
				fs::FSEventStreamInvalidate(stream);
				fs::FSEventStreamRelease(stream);
			}
			debug!("fsevents stream closed");
			true
		}
		None => false,
	}
}

pub(crate) fn watch(path: &Path, handler: &mut dyn EventHandler, liveness: &Liveness) -> bool {
	let queue =
		unsafe { ffi::dispatch_get_global_queue(ffi::DISPATCH_QUEUE_PRIORITY_DEFAULT, 0) };
	let ctx = StreamCtx {
		handler: Mutex::new(handler),
		seen_created: Mutex::new(HashSet::new()),
		last_rename_from: Mutex::new(None),
	};

	let stream = open_event_stream(path, queue, &ctx as *const StreamCtx<'_> as *mut c_void);
	let state_ok = liveness.wait() == State::Released;
	let close_ok = close_event_stream(stream);
	// A straggling callback after release still finds `ctx` alive on this
	// frame; see the module notes.
	unsafe { libc::usleep(1000) };
	state_ok && close_ok
}
