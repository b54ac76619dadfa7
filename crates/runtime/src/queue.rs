use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::event::Event;

/// Thread-safe FIFO event queue. Bus adapter receive threads push from
/// outside the tick; the engine bulk-drains once per poll so events
/// enqueued during dispatch run on the next tick.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.inner.lock().push_back(event);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Move every queued event into `sink`, preserving FIFO order.
    pub fn drain_into(&self, sink: &mut Vec<Event>) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.len();
        sink.reserve(count);
        sink.extend(inner.drain(..));
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;

    #[test]
    fn drain_preserves_fifo_order() {
        let queue = EventQueue::new();
        for tactic in ["a", "b", "c"] {
            queue.push(Event::new(EventBody::Tactic {
                tactic: tactic.into(),
            }));
        }
        let mut sink = Vec::new();
        assert_eq!(queue.drain_into(&mut sink), 3);
        assert!(queue.is_empty());
        let names: Vec<_> = sink
            .iter()
            .map(|e| match &e.body {
                EventBody::Tactic { tactic } => tactic.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn push_from_other_threads() {
        let queue = std::sync::Arc::new(EventQueue::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    queue.push(Event::new(EventBody::Tactic { tactic: "t".into() }));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.len(), 400);
    }
}
