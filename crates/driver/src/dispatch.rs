//! Completion dispatch.
//!
//! Transport completions either run inline in the completion context or are
//! queued and drained by `service()` on whatever context the embedder
//! dedicates to it. Deferred mode keeps completion work off the interrupt
//! path at the cost of added latency.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use spin::Mutex;

use crate::config::CompletionDispatch;

type Completion = Box<dyn FnOnce() + Send>;

pub struct Dispatcher {
    mode: CompletionDispatch,
    queue: Mutex<VecDeque<Completion>>,
}

impl Dispatcher {
    pub fn new(mode: CompletionDispatch) -> Self {
        Self {
            mode,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn dispatch(&self, work: Completion) {
        match self.mode {
            CompletionDispatch::Inline => work(),
            CompletionDispatch::Deferred => self.queue.lock().push_back(work),
        }
    }

    /// Drain queued completions in order. Each runs outside the queue lock
    /// so a completion may dispatch further work.
    pub fn service(&self) {
        loop {
            let Some(work) = self.queue.lock().pop_front() else {
                return;
            };
            work();
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}
