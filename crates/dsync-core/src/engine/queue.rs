// ── Model event queue ──
//
// FIFO of model events with a single consumer. Every event gets a
// sequence number; the consumer reports each processed number through
// a watch channel, which is what barrier waiters block on.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::trace;

use crate::event::ModelEvent;

#[derive(Debug)]
struct QueueState {
    events: VecDeque<(u64, ModelEvent)>,
    next_seq: u64,
    initializing: bool,
    /// Topology-dirty events swallowed while initializing.
    dirty: bool,
}

#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    processed: watch::Sender<u64>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// A new queue starts in the initializing phase.
    pub fn new() -> Self {
        let (processed, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                next_seq: 1,
                initializing: true,
                dirty: false,
            }),
            notify: Notify::new(),
            processed,
        }
    }

    /// Append an event and wake the consumer. Never blocks.
    pub fn enqueue(&self, event: ModelEvent) {
        {
            let mut state = self.state.lock();
            if state.initializing && event.is_topology_dirty() {
                state.dirty = true;
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            trace!(seq, kind = %event.kind, "enqueued model event");
            state.events.push_back((seq, event));
        }
        self.notify.notify_one();
    }

    /// Next event, or `None` once `timeout` passes with the queue empty.
    pub async fn pop(&self, timeout: Duration) -> Option<(u64, ModelEvent)> {
        let deadline = Instant::now() + timeout;
        loop {
            let next = self.state.lock().events.pop_front();
            if next.is_some() {
                return next;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Record that the event with sequence number `seq` has been applied.
    pub fn mark_processed(&self, seq: u64) {
        self.processed.send_if_modified(|current| {
            if seq > *current {
                *current = seq;
                true
            } else {
                false
            }
        });
    }

    /// Sequence number of the last applied event.
    pub fn processed(&self) -> u64 {
        *self.processed.borrow()
    }

    /// Wait until everything enqueued before this call has been applied.
    ///
    /// Targets the topology-dirty or barrier marker at the tail of the
    /// queue, appending a barrier marker if the tail is something else. Returns `false` if
    /// the target is not reached within `timeout`.
    pub async fn barrier(&self, timeout: Duration) -> bool {
        let target = {
            let mut state = self.state.lock();
            match state.events.back() {
                Some((seq, event)) if event.is_sync_marker() => *seq,
                _ => {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.events.push_back((seq, ModelEvent::barrier()));
                    seq
                }
            }
        };
        self.notify.notify_one();

        let mut rx = self.processed.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|done| *done >= target)).await,
            Ok(Ok(_))
        )
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_initializing(&self) -> bool {
        self.state.lock().initializing
    }

    /// Leave the initializing phase, replaying a swallowed dirty flag as
    /// one real event. Returns whether this call ended the phase.
    pub fn finish_initialization(&self) -> bool {
        let (ended, replay) = {
            let mut state = self.state.lock();
            let ended = std::mem::replace(&mut state.initializing, false);
            (ended, std::mem::take(&mut state.dirty))
        };
        if replay {
            self.enqueue(ModelEvent::topology_dirty());
        }
        ended
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::event::ModelEventKind;
    use tokio_test::{assert_pending, assert_ready};

    fn blink(device: i32) -> ModelEvent {
        ModelEvent::new(ModelEventKind::BlinkDevice).with_params([device])
    }

    #[tokio::test]
    async fn events_come_out_in_order() {
        let queue = EventQueue::new();
        queue.enqueue(blink(1));
        queue.enqueue(blink(2));
        let (first, a) = queue.pop(Duration::from_millis(10)).await.unwrap();
        let (second, b) = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert!(first < second);
        assert_eq!((a.params[0], b.params[0]), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_on_an_empty_queue() {
        let queue = EventQueue::new();
        assert!(queue.pop(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn enqueue_wakes_a_waiting_consumer() {
        let queue = EventQueue::new();
        let mut pop = tokio_test::task::spawn(queue.pop(Duration::from_secs(30)));
        assert_pending!(pop.poll());

        queue.enqueue(blink(9));
        assert!(pop.is_woken());
        let (_, event) = assert_ready!(pop.poll()).unwrap();
        assert_eq!(event.params, vec![9]);
    }

    #[tokio::test]
    async fn dirty_events_are_folded_while_initializing() {
        let queue = EventQueue::new();
        queue.enqueue(ModelEvent::topology_dirty());
        queue.enqueue(ModelEvent::topology_dirty());
        assert!(queue.is_empty());

        assert!(queue.finish_initialization());
        assert_eq!(queue.len(), 1);
        assert!(!queue.finish_initialization());

        queue.enqueue(ModelEvent::topology_dirty());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn barrier_reuses_a_dirty_tail() {
        let queue = EventQueue::new();
        queue.finish_initialization();
        queue.enqueue(blink(1));
        queue.enqueue(ModelEvent::topology_dirty());
        assert!(!queue.barrier(Duration::from_millis(1)).await);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn barrier_queues_its_own_marker() {
        let queue = EventQueue::new();
        queue.finish_initialization();
        queue.enqueue(blink(1));
        assert!(!queue.barrier(Duration::from_millis(1)).await);
        assert!(!queue.barrier(Duration::from_millis(1)).await);
        assert_eq!(queue.len(), 2);

        let _ = queue.pop(Duration::from_millis(1)).await.unwrap();
        let (_, marker) = queue.pop(Duration::from_millis(1)).await.unwrap();
        assert_eq!(marker.kind, ModelEventKind::Barrier);
        assert!(!marker.is_topology_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn barrier_times_out_without_a_consumer() {
        let queue = EventQueue::new();
        queue.enqueue(blink(1));
        assert!(!queue.barrier(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn barrier_returns_once_the_marker_is_processed() {
        let queue = Arc::new(EventQueue::new());
        queue.enqueue(blink(1));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some((seq, _)) = queue.pop(Duration::from_secs(5)).await {
                    queue.mark_processed(seq);
                }
            })
        };

        assert!(queue.barrier(Duration::from_secs(5)).await);
        assert!(queue.processed() >= 2);
        consumer.abort();
    }
}
