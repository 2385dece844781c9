//! Two sibling byte channels sharing one insertion-ordered buffer.
//!
//! Until either side is subscribed, every submission is labeled and
//! queued. The first subscription starts a drain that dispatches one
//! queued event per scheduling step, so an observer that fails on one
//! event surfaces before the next is delivered. Once the queue is
//! empty, submissions flow directly to their lane.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, ScriptError};
use crate::stream::ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    First,
    Second,
}

impl Lane {
    fn index(self) -> usize {
        match self {
            Lane::First => 0,
            Lane::Second => 1,
        }
    }
}

enum Event {
    Data(Vec<u8>),
    Close,
}

#[derive(PartialEq)]
enum Mode {
    Buffering,
    Draining,
    Direct,
}

struct PairShared {
    queue: VecDeque<(Lane, Event)>,
    mode: Mode,
    outs: [Option<mpsc::UnboundedSender<Vec<u8>>>; 2],
    receivers: [Option<mpsc::UnboundedReceiver<Vec<u8>>>; 2],
}

impl PairShared {
    fn deliver(&mut self, lane: Lane, event: Event) {
        let slot = &mut self.outs[lane.index()];
        match event {
            Event::Data(bytes) => {
                if let Some(tx) = slot {
                    let _ = tx.send(bytes);
                }
            }
            // Dropping the sender is what closes the lane's stream.
            Event::Close => *slot = None,
        }
    }
}

pub struct EntangledPair {
    shared: Arc<Mutex<PairShared>>,
}

impl EntangledPair {
    pub fn new() -> EntangledPair {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        EntangledPair {
            shared: Arc::new(Mutex::new(PairShared {
                queue: VecDeque::new(),
                mode: Mode::Buffering,
                outs: [Some(tx_a), Some(tx_b)],
                receivers: [Some(rx_a), Some(rx_b)],
            })),
        }
    }

    pub fn sender(&self, lane: Lane) -> EntangledSender {
        EntangledSender {
            lane,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take a lane's output stream. The first subscription on either
    /// lane starts the buffered drain.
    pub fn subscribe(&self, lane: Lane) -> Result<ByteStream> {
        let mut shared = self.shared.lock();
        let rx = shared.receivers[lane.index()]
            .take()
            .ok_or(ScriptError::AlreadyConsumed {
                stream: "entangled lane",
            })?;
        if shared.mode == Mode::Buffering {
            shared.mode = Mode::Draining;
            tokio::spawn(drain(Arc::clone(&self.shared)));
        }
        Ok(ByteStream::from_channel(rx))
    }
}

impl Default for EntangledPair {
    fn default() -> Self {
        EntangledPair::new()
    }
}

async fn drain(shared: Arc<Mutex<PairShared>>) {
    loop {
        {
            let mut guard = shared.lock();
            match guard.queue.pop_front() {
                Some((lane, event)) => guard.deliver(lane, event),
                None => {
                    guard.mode = Mode::Direct;
                    return;
                }
            }
        }
        // One event per scheduling step, to give an observer that fails
        // room to surface before the next event lands.
        tokio::task::yield_now().await;
    }
}

#[derive(Clone)]
pub struct EntangledSender {
    lane: Lane,
    shared: Arc<Mutex<PairShared>>,
}

impl EntangledSender {
    pub fn send(&self, bytes: Vec<u8>) {
        let mut shared = self.shared.lock();
        match shared.mode {
            Mode::Buffering | Mode::Draining => {
                shared.queue.push_back((self.lane, Event::Data(bytes)));
            }
            Mode::Direct => shared.deliver(self.lane, Event::Data(bytes)),
        }
    }

    pub fn close(&self) {
        let mut shared = self.shared.lock();
        match shared.mode {
            Mode::Buffering | Mode::Draining => {
                shared.queue.push_back((self.lane, Event::Close));
            }
            Mode::Direct => shared.deliver(self.lane, Event::Close),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscription_replays_in_order() {
        let pair = EntangledPair::new();
        let a = pair.sender(Lane::First);
        let b = pair.sender(Lane::Second);
        a.send(b"a1".to_vec());
        b.send(b"b1".to_vec());
        a.send(b"a2".to_vec());
        a.close();
        b.close();

        let first = pair.subscribe(Lane::First).unwrap();
        let second = pair.subscribe(Lane::Second).unwrap();
        assert_eq!(first.bytes().await, b"a1a2");
        assert_eq!(second.bytes().await, b"b1");
    }

    #[tokio::test]
    async fn events_flow_directly_after_drain() {
        let pair = EntangledPair::new();
        let a = pair.sender(Lane::First);
        a.send(b"buffered".to_vec());

        let stream = pair.subscribe(Lane::First).unwrap();
        // Let the drain finish.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        a.send(b" live".to_vec());
        a.close();
        pair.sender(Lane::Second).close();
        assert_eq!(stream.bytes().await, b"buffered live");
    }

    #[tokio::test]
    async fn second_subscription_fails() {
        let pair = EntangledPair::new();
        pair.subscribe(Lane::First).unwrap();
        assert!(matches!(
            pair.subscribe(Lane::First),
            Err(ScriptError::AlreadyConsumed { .. })
        ));
    }
}
