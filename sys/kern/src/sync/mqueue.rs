// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message queues: a thin envelope over a bounded FIFO.
//!
//! Unlike the mutex and condvar these never block; senders see a full
//! queue as an error and receivers see an empty one as `None`, and it is
//! up to the tasks involved to pair a queue with a primitive that blocks
//! if they want rendezvous behavior. Every operation takes the queue's own
//! spinlock with interrupts saved.

use abi::Error;
use waitq::Queue;

use crate::spinlock::SpinLock;

struct MqState<T, const N: usize> {
    q: Queue<T, N>,
    destroyed: bool,
}

pub struct MessageQueue<T, const N: usize> {
    state: SpinLock<MqState<T, N>>,
}

impl<T, const N: usize> MessageQueue<T, N> {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(MqState {
                q: Queue::new(),
                destroyed: false,
            }),
        }
    }

    /// Appends a message. Fails on a full (or destroyed) queue; the caller
    /// decides whether to retry, drop, or block on something.
    pub fn enqueue(&self, msg: T) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.destroyed {
            return Err(Error::Fail);
        }
        st.q.push_back(msg).map_err(|_| Error::Fail)
    }

    /// Removes the oldest message, or `None` when empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut st = self.state.lock();
        if st.destroyed {
            return None;
        }
        st.q.pop_front()
    }

    /// Copies the oldest message without removing it.
    pub fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        let st = self.state.lock();
        if st.destroyed {
            return None;
        }
        st.q.peek().copied()
    }

    pub fn len(&self) -> usize {
        self.state.lock().q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().q.is_empty()
    }

    /// Retires the queue. A queue still carrying messages refuses; drain
    /// it first.
    pub fn destroy(&self) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.destroyed {
            return Err(Error::Fail);
        }
        if !st.q.is_empty() {
            return Err(Error::MqNotEmpty);
        }
        st.destroyed = true;
        Ok(())
    }
}

impl<T, const N: usize> Default for MessageQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct Msg(u32);

    #[test]
    fn fifo_delivery() {
        let mq: MessageQueue<Msg, 4> = MessageQueue::new();
        mq.enqueue(Msg(1)).unwrap();
        mq.enqueue(Msg(2)).unwrap();
        assert_eq!(mq.peek(), Some(Msg(1)));
        assert_eq!(mq.dequeue(), Some(Msg(1)));
        assert_eq!(mq.dequeue(), Some(Msg(2)));
        assert_eq!(mq.dequeue(), None);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let mq: MessageQueue<Msg, 2> = MessageQueue::new();
        mq.enqueue(Msg(1)).unwrap();
        mq.enqueue(Msg(2)).unwrap();
        assert_eq!(mq.enqueue(Msg(3)), Err(Error::Fail));
        assert_eq!(mq.len(), 2);
    }

    #[test]
    fn destroy_refuses_non_empty() {
        let mq: MessageQueue<Msg, 2> = MessageQueue::new();
        mq.enqueue(Msg(9)).unwrap();
        assert_eq!(mq.destroy(), Err(Error::MqNotEmpty));
        // Still usable after the refusal.
        assert_eq!(mq.dequeue(), Some(Msg(9)));
        assert_eq!(mq.destroy(), Ok(()));
        // And inert afterwards.
        assert_eq!(mq.enqueue(Msg(1)), Err(Error::Fail));
        assert_eq!(mq.dequeue(), None);
        assert_eq!(mq.destroy(), Err(Error::Fail));
    }
}
