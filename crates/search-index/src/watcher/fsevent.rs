//! macOS FSEvents event source.
//!
//! Each subscription runs one FSEvents stream on a dedicated run-loop thread.
//! Raw paths, flags and ids are forwarded untouched; decoding happens in the
//! watcher.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use core_foundation_sys::array::{CFArrayCreate, CFArrayRef};
use core_foundation_sys::base::{kCFAllocatorDefault, CFIndex, CFRelease};
use core_foundation_sys::runloop::{
    kCFRunLoopDefaultMode, CFRunLoopGetCurrent, CFRunLoopRef, CFRunLoopRunInMode, CFRunLoopStop,
};
use core_foundation_sys::string::{kCFStringEncodingUTF8, CFStringCreateWithBytes, CFStringRef};
use parking_lot::{Condvar, Mutex};

use super::cursor::SequenceId;
use super::source::{BatchSink, EventSource, RawBatch, Subscription};
use crate::error::{Result, SearchIndexError};

// ---------------------------------------------------------------------------
// FSEvents C types and constants
// ---------------------------------------------------------------------------

type FSEventStreamRef = *mut c_void;
type FSEventStreamEventId = u64;

#[repr(C)]
struct FSEventStreamContext {
    version: CFIndex,
    info: *mut c_void,
    retain: Option<extern "C" fn(*const c_void) -> *const c_void>,
    release: Option<extern "C" fn(*const c_void)>,
    copy_description: Option<extern "C" fn(*const c_void) -> CFStringRef>,
}

type FSEventStreamCallback = extern "C" fn(
    stream_ref: FSEventStreamRef,
    client_callback_info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const FSEventStreamEventId,
);

const K_FS_EVENT_STREAM_CREATE_FLAG_NO_DEFER: u32 = 0x02;
const K_FS_EVENT_STREAM_CREATE_FLAG_WATCH_ROOT: u32 = 0x04;
const K_FS_EVENT_STREAM_CREATE_FLAG_FILE_EVENTS: u32 = 0x10;

/// How long the run loop sleeps before rechecking the stop flag.
const RUN_LOOP_SLICE_SECS: f64 = 0.25;

#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    fn FSEventStreamCreate(
        allocator: *const c_void,
        callback: FSEventStreamCallback,
        context: *mut FSEventStreamContext,
        paths_to_watch: CFArrayRef,
        since_when: FSEventStreamEventId,
        latency: f64,
        flags: u32,
    ) -> FSEventStreamRef;

    fn FSEventStreamScheduleWithRunLoop(
        stream: FSEventStreamRef,
        run_loop: CFRunLoopRef,
        run_loop_mode: CFStringRef,
    );

    fn FSEventStreamStart(stream: FSEventStreamRef) -> bool;
    fn FSEventStreamStop(stream: FSEventStreamRef);
    fn FSEventStreamInvalidate(stream: FSEventStreamRef);
    fn FSEventStreamRelease(stream: FSEventStreamRef);

    fn FSEventsGetCurrentEventId() -> FSEventStreamEventId;
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Event source backed by a Core Services FSEvents stream.
#[derive(Debug, Clone, Copy)]
pub struct FsEventSource {
    latency: Duration,
}

impl Default for FsEventSource {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl FsEventSource {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// The most recent id the system has handed out, across all streams.
    pub fn current_event_id() -> SequenceId {
        SequenceId(unsafe { FSEventsGetCurrentEventId() })
    }
}

impl EventSource for FsEventSource {
    type Subscription = FsEventSubscription;

    fn subscribe(
        &mut self,
        roots: &[PathBuf],
        since: SequenceId,
        sink: BatchSink,
    ) -> Result<FsEventSubscription> {
        if roots.is_empty() {
            return Err(SearchIndexError::Watch("no roots to watch".into()));
        }
        let roots: Vec<String> = roots
            .iter()
            .map(|root| root.to_string_lossy().into_owned())
            .collect();
        let latency = self.latency.as_secs_f64();

        let startup = Arc::new(Startup::default());
        let stopped = Arc::new(AtomicBool::new(false));
        let thread_startup = startup.clone();
        let thread_stopped = stopped.clone();

        let thread = thread::Builder::new()
            .name("fsevents".into())
            .spawn(move || {
                run_stream(&roots, since.get(), latency, sink, &thread_startup, &thread_stopped)
            })
            .map_err(|error| {
                SearchIndexError::Watch(format!("failed to spawn FSEvents thread: {error}"))
            })?;

        match startup.wait() {
            Ok(run_loop) => Ok(FsEventSubscription {
                run_loop: Some(run_loop),
                stopped,
                thread: Some(thread),
            }),
            Err(message) => {
                let _ = thread.join();
                Err(SearchIndexError::Watch(message))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A wrapper around `CFRunLoopRef` that is `Send` + `Sync`.
///
/// Safety: `CFRunLoopStop` may be called from any thread to stop a run loop
/// running on another thread.
#[derive(Clone, Copy)]
struct SendableRunLoop(CFRunLoopRef);
unsafe impl Send for SendableRunLoop {}
unsafe impl Sync for SendableRunLoop {}

pub struct FsEventSubscription {
    run_loop: Option<SendableRunLoop>,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Subscription for FsEventSubscription {
    fn unsubscribe(&mut self) {
        let Some(run_loop) = self.run_loop.take() else {
            return;
        };
        self.stopped.store(true, Ordering::SeqCst);
        unsafe {
            CFRunLoopStop(run_loop.0);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("FSEvents thread panicked during shutdown");
            }
        }
    }
}

impl Drop for FsEventSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// Run-loop thread
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Startup {
    outcome: Mutex<Option<std::result::Result<SendableRunLoop, String>>>,
    ready: Condvar,
}

impl Startup {
    fn publish(&self, outcome: std::result::Result<SendableRunLoop, String>) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self) -> std::result::Result<SendableRunLoop, String> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.take() {
                return outcome;
            }
            self.ready.wait(&mut outcome);
        }
    }
}

fn run_stream(
    roots: &[String],
    since: u64,
    latency: f64,
    sink: BatchSink,
    startup: &Startup,
    stopped: &AtomicBool,
) {
    // Safety: all FFI calls below follow the documented CoreServices API contract.
    unsafe {
        let cf_roots: Vec<CFStringRef> = roots.iter().map(|root| str_to_cfstring(root)).collect();
        let path_array = CFArrayCreate(
            kCFAllocatorDefault,
            cf_roots.as_ptr() as *const *const c_void,
            cf_roots.len() as CFIndex,
            std::ptr::null(),
        );

        let sink_ptr = Box::into_raw(Box::new(sink)) as *mut c_void;
        let mut context = FSEventStreamContext {
            version: 0,
            info: sink_ptr,
            retain: None,
            release: None,
            copy_description: None,
        };

        let flags = K_FS_EVENT_STREAM_CREATE_FLAG_NO_DEFER
            | K_FS_EVENT_STREAM_CREATE_FLAG_FILE_EVENTS
            | K_FS_EVENT_STREAM_CREATE_FLAG_WATCH_ROOT;

        let stream = FSEventStreamCreate(
            kCFAllocatorDefault,
            fsevent_callback,
            &mut context,
            path_array,
            since,
            latency,
            flags,
        );

        let release_inputs = || {
            CFRelease(path_array as *const c_void);
            for cf_root in &cf_roots {
                CFRelease(*cf_root as *const c_void);
            }
            drop(Box::from_raw(sink_ptr as *mut BatchSink));
        };

        if stream.is_null() {
            release_inputs();
            startup.publish(Err("FSEventStreamCreate returned null".into()));
            return;
        }

        let run_loop = CFRunLoopGetCurrent();
        FSEventStreamScheduleWithRunLoop(stream, run_loop, kCFRunLoopDefaultMode);
        if !FSEventStreamStart(stream) {
            FSEventStreamInvalidate(stream);
            FSEventStreamRelease(stream);
            release_inputs();
            startup.publish(Err("FSEventStreamStart failed".into()));
            return;
        }

        startup.publish(Ok(SendableRunLoop(run_loop)));

        // A stop request issued before the loop runs would be lost, so the
        // loop runs in slices and rechecks the flag.
        while !stopped.load(Ordering::SeqCst) {
            CFRunLoopRunInMode(kCFRunLoopDefaultMode, RUN_LOOP_SLICE_SECS, 0);
        }

        FSEventStreamStop(stream);
        FSEventStreamInvalidate(stream);
        FSEventStreamRelease(stream);
        release_inputs();
    }
}

extern "C" fn fsevent_callback(
    _stream_ref: FSEventStreamRef,
    client_callback_info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const FSEventStreamEventId,
) {
    let mut batch = RawBatch::new();

    let sink = unsafe {
        let paths_ptr = event_paths as *const *const c_char;
        for i in 0..num_events {
            let c_path = *paths_ptr.add(i);
            let path = CStr::from_ptr(c_path).to_string_lossy().into_owned();
            batch.push(path, *event_flags.add(i), *event_ids.add(i));
        }
        &*(client_callback_info as *const BatchSink)
    };

    // Unwinding into CoreServices would abort the process.
    if panic::catch_unwind(AssertUnwindSafe(|| sink(batch))).is_err() {
        log::error!("FSEvents batch handler panicked");
    }
}

unsafe fn str_to_cfstring(s: &str) -> CFStringRef {
    CFStringCreateWithBytes(
        kCFAllocatorDefault,
        s.as_ptr(),
        s.len() as CFIndex,
        kCFStringEncodingUTF8,
        false as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn current_event_id_is_a_real_position() {
        assert!(!FsEventSource::current_event_id().is_since_now());
    }

    #[test]
    fn subscribe_then_unsubscribe_joins_the_thread() {
        let temp = TempDir::new().expect("tempdir");
        let mut source = FsEventSource::new(Duration::from_millis(10));
        let sink: BatchSink = Arc::new(|_batch| {});
        let mut subscription = source
            .subscribe(&[temp.path().to_path_buf()], SequenceId::SINCE_NOW, sink)
            .expect("subscribe");
        subscription.unsubscribe();
        subscription.unsubscribe();
    }

    #[test]
    fn empty_root_list_is_rejected() {
        let mut source = FsEventSource::default();
        let sink: BatchSink = Arc::new(|_batch| {});
        assert!(source.subscribe(&[], SequenceId::SINCE_NOW, sink).is_err());
    }
}
