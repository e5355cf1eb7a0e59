//! Long-lived frame hand-off points shared by connectors and WebSocket pumps.
//!
//! A [`FrameQueue`] holds no frames of its own.  A frame only moves when a
//! consumer is already waiting in [`FrameQueue::recv`]:
//!
//! - [`FrameQueue::offer`] hands the frame to a waiting consumer, or drops it
//!   if nobody is waiting (used for device data: stale readings are worse
//!   than gaps).
//! - [`FrameQueue::send`] waits until a consumer takes the frame (used for
//!   commands: they must not be dropped silently).
//!
//! Each waiting consumer registers a `oneshot` sender; producers pop waiters
//! in arrival order.
//!
//! ```text
//! recv ──► waiters: [tx₁, tx₂, ...] ◄── offer / send pop the oldest live waiter
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Notify};

use crate::domain::Frame;

/// A frame in flight from a producer to one consumer.
#[derive(Debug)]
struct Handoff {
    frame: Frame,
    /// Set by [`FrameQueue::send`]: the producer was told the frame is taken,
    /// so it must reach some consumer even if the first one went away.
    must_deliver: bool,
}

#[derive(Debug, Default)]
struct Shared {
    waiters: Mutex<VecDeque<oneshot::Sender<Handoff>>>,
    /// Sent frames whose consumer was cancelled right after taking them.
    returned: Mutex<VecDeque<Frame>>,
    waiter_added: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Gives `handoff` to the oldest consumer still waiting.
fn pop_waiter(
    waiters: &mut VecDeque<oneshot::Sender<Handoff>>,
    mut handoff: Handoff,
) -> Result<(), Handoff> {
    while let Some(waiter) = waiters.pop_front() {
        match waiter.send(handoff) {
            Ok(()) => return Ok(()),
            // That consumer stopped waiting; try the next one.
            Err(back) => handoff = back,
        }
    }
    Err(handoff)
}

impl Shared {
    /// Queues `waiter`, unless a returned frame is already there to take.
    ///
    /// Lock order is `waiters` then `returned`.
    fn register(&self, waiter: oneshot::Sender<Handoff>) -> Option<Frame> {
        {
            let mut waiters = lock(&self.waiters);
            if let Some(frame) = lock(&self.returned).pop_front() {
                return Some(frame);
            }
            waiters.retain(|w| !w.is_closed());
            waiters.push_back(waiter);
        }
        self.waiter_added.notify_waiters();
        None
    }

    fn hand_off(&self, handoff: Handoff) -> Result<(), Handoff> {
        pop_waiter(&mut lock(&self.waiters), handoff)
    }

    /// Called when a consumer is dropped holding a frame it never returned.
    fn reclaim(&self, handoff: Handoff) {
        let mut waiters = lock(&self.waiters);
        if let Err(handoff) = pop_waiter(&mut waiters, handoff) {
            if handoff.must_deliver {
                lock(&self.returned).push_front(handoff.frame);
            }
        }
    }
}

/// A consumer's registration; gives back an untaken frame when dropped.
struct Waiter<'a> {
    rx: oneshot::Receiver<Handoff>,
    shared: &'a Shared,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(handoff) = self.rx.try_recv() {
            self.shared.reclaim(handoff);
        }
    }
}

/// An unbuffered, cloneable, multi-producer multi-consumer hand-off of
/// frames.
///
/// Clones share the same waiters.  Every frame goes to exactly one consumer.
#[derive(Debug, Clone, Default)]
pub struct FrameQueue {
    shared: Arc<Shared>,
}

impl FrameQueue {
    /// Creates a queue with no waiting consumers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands `frame` to a waiting consumer without waiting.
    ///
    /// Returns `false` if nobody was waiting and the frame was dropped.
    pub fn offer(&self, frame: Frame) -> bool {
        self.shared
            .hand_off(Handoff {
                frame,
                must_deliver: false,
            })
            .is_ok()
    }

    /// Hands `frame` over, waiting until a consumer takes it.
    ///
    /// Dropping the future before it resolves drops the frame undelivered.
    pub async fn send(&self, frame: Frame) {
        let mut handoff = Handoff {
            frame,
            must_deliver: true,
        };
        loop {
            let notified = self.shared.waiter_added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.hand_off(handoff) {
                Ok(()) => return,
                Err(back) => handoff = back,
            }
            notified.await;
        }
    }

    /// Waits for the next frame.
    ///
    /// Cancel-safe: a sent frame that reached this consumer as it was being
    /// dropped is passed on to the next consumer.
    pub async fn recv(&self) -> Frame {
        loop {
            let (tx, rx) = oneshot::channel();
            if let Some(frame) = self.shared.register(tx) {
                return frame;
            }
            let mut waiter = Waiter {
                rx,
                shared: &self.shared,
            };
            if let Ok(handoff) = (&mut waiter.rx).await {
                return handoff.frame;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(100);

    /// Spawns a consumer and gives it time to start waiting.
    async fn waiting_consumer(queue: &FrameQueue) -> tokio::task::JoinHandle<Frame> {
        let queue = queue.clone();
        let consumer = tokio::spawn(async move { queue.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        consumer
    }

    #[tokio::test]
    async fn test_offer_without_consumer_drops_the_frame() {
        // Arrange
        let queue = FrameQueue::new();

        // Act: nobody is waiting, so the frame goes nowhere
        let delivered = queue.offer(b"stale".to_vec());
        let consumer = waiting_consumer(&queue).await;
        let fresh = queue.offer(b"fresh".to_vec());

        // Assert: the late consumer sees only the frame offered while it waited
        assert!(!delivered);
        assert!(fresh);
        assert_eq!(consumer.await.unwrap(), b"fresh".to_vec());
    }

    #[tokio::test]
    async fn test_send_blocks_until_a_consumer_takes_the_frame() {
        let queue = FrameQueue::new();

        let blocked = timeout(SHORT, queue.send(vec![1])).await;
        assert!(blocked.is_err(), "send must wait while nobody receives");

        let producer = queue.clone();
        let sender = tokio::spawn(async move { producer.send(vec![2]).await });
        assert_eq!(timeout(SHORT, queue.recv()).await.unwrap(), vec![2]);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_recv_does_not_swallow_offers() {
        let queue = FrameQueue::new();

        // A consumer that gives up before anything arrives.
        assert!(timeout(Duration::from_millis(10), queue.recv()).await.is_err());

        assert!(!queue.offer(vec![1]));
    }

    #[tokio::test]
    async fn test_sent_frame_survives_a_consumer_dropped_after_hand_off() {
        // Arrange: a consumer registered, but not polled again after the send
        let queue = FrameQueue::new();
        let mut stalled = Box::pin(queue.recv());
        assert!(futures_util::poll!(stalled.as_mut()).is_pending());
        let producer = queue.clone();
        timeout(SHORT, producer.send(b"cmd".to_vec()))
            .await
            .expect("send must complete once a consumer waits");

        // Act: the consumer is dropped holding the frame
        drop(stalled);

        // Assert: the next consumer gets it
        assert_eq!(timeout(SHORT, queue.recv()).await.unwrap(), b"cmd".to_vec());
    }

    #[tokio::test]
    async fn test_clones_share_frames_without_duplication() {
        let queue = FrameQueue::new();
        let a = waiting_consumer(&queue).await;
        let b = waiting_consumer(&queue.clone()).await;

        queue.send(vec![1]).await;
        queue.send(vec![2]).await;

        let mut got = vec![a.await.unwrap(), b.await.unwrap()];
        got.sort();
        assert_eq!(got, vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_sends_arrive_in_order() {
        let queue = FrameQueue::new();
        let producer = queue.clone();
        let sender = tokio::spawn(async move {
            for i in 0..10u8 {
                producer.send(vec![i]).await;
            }
        });

        for i in 0..10u8 {
            assert_eq!(timeout(SHORT, queue.recv()).await.unwrap(), vec![i]);
        }
        sender.await.unwrap();
    }
}
