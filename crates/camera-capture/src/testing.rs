//! Test doubles shared by the unit tests

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use crate::frame::Frame;
use crate::handler::{FrameHandler, HandlerError, HandlerNotifier};

/// Counts WARN events emitted on the current thread
struct WarnCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Run `f` and count the warnings it logs on this thread
pub(crate) fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let counter = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarnCounter(counter.clone()));
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, counter.load(Ordering::SeqCst))
}

/// How a [`TestHandler`] reacts to delivered frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    Record,
    Fail,
    Panic,
}

/// Frame handler recording the sequence numbers it receives
pub(crate) struct TestHandler {
    name: String,
    running: AtomicBool,
    notifier: HandlerNotifier,
    behavior: Behavior,
    sequences: Mutex<Vec<u64>>,
    stop_calls: AtomicUsize,
}

impl TestHandler {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Self::with_behavior(name, Behavior::Record)
    }

    pub(crate) fn with_behavior(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            running: AtomicBool::new(false),
            notifier: HandlerNotifier::new(),
            behavior,
            sequences: Mutex::new(Vec::new()),
            stop_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn sequences(&self) -> Vec<u64> {
        self.sequences.lock().clone()
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.sequences.lock().len()
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl FrameHandler for TestHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), HandlerError> {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.notifier.notify(crate::HandlerEvent::Started);
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), HandlerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.running.swap(false, Ordering::SeqCst) {
            self.notifier.notify(crate::HandlerEvent::Stopped);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn add_frame(&self, frame: &Frame) -> Result<(), HandlerError> {
        if !self.is_running() {
            return Ok(());
        }
        match self.behavior {
            Behavior::Record => {
                self.sequences.lock().push(frame.sequence());
                Ok(())
            }
            Behavior::Fail => Err(HandlerError::Encoder("simulated failure".to_string())),
            Behavior::Panic => panic!("handler {} exploded", self.name),
        }
    }

    fn notifier(&self) -> &HandlerNotifier {
        &self.notifier
    }
}
