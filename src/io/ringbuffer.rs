use crate::error::{RecvError, SendError, TryRecvError};
use crate::io::base::{BaseRx, BaseTx, RxPairExt, TxPairExt};
use crate::utils::CancelToken;
use crossbeam::utils::Backoff;
use ringbuf::consumer::Consumer;
use ringbuf::producer::Producer;
use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::thread;
use std::time::{Duration, Instant};

/// SPSC ring channel. One producer (the engine loop), one consumer
/// (an extension group thread).
pub struct RingBuffer;

impl RingBuffer {
    pub fn bounded<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
        let rb = HeapRb::<T>::new(capacity);
        let (prod, cons) = rb.split();

        (RingSender { prod }, RingReceiver { cons })
    }
}

pub struct RingSender<T> {
    prod: HeapProd<T>,
}

impl<T: Send + 'static> BaseTx for RingSender<T> {
    type ItemType = T;

    #[inline]
    fn try_send(&mut self, a: T) -> Result<(), SendError<T>> {
        self.prod.try_push(a).map_err(|v| SendError::full(Some(v)))
    }

    fn send(
        &mut self,
        mut a: T,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<T>> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SendError::cancelled(Some(a)));
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Err(SendError::timeout(Some(a)));
                }
            }

            match self.prod.try_push(a) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    a = back;
                    spins = spins.saturating_add(1);
                    if spins < 64 {
                        backoff.spin();
                    } else if spins < 256 {
                        backoff.snooze();
                    } else {
                        thread::sleep(Duration::from_micros(2));
                    }
                }
            }
        }
    }
}

pub struct RingReceiver<T> {
    cons: HeapCons<T>,
}

impl<T: Send + 'static> BaseRx for RingReceiver<T> {
    type ItemType = T;

    #[inline]
    fn try_recv(&mut self) -> Result<T, TryRecvError> {
        self.cons.try_pop().ok_or(TryRecvError::Empty)
    }

    fn recv(&mut self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<T, RecvError> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Err(RecvError::Timeout);
                }
            }

            match self.cons.try_pop() {
                Some(a) => return Ok(a),
                None => {
                    spins = spins.saturating_add(1);
                    if spins < 64 {
                        backoff.spin();
                    } else if spins < 256 {
                        backoff.snooze();
                    } else {
                        thread::sleep(Duration::from_micros(2));
                    }
                }
            }
        }
    }
}

impl<T: Send + 'static> RxPairExt for RingReceiver<T> {
    type TxHalf = RingSender<T>;

    fn bound(cap: usize) -> (Self::TxHalf, Self) {
        RingBuffer::bounded(cap)
    }
}

impl<T: Send + 'static> TxPairExt for RingSender<T> {
    type RxHalf = RingReceiver<T>;

    fn bound(cap: usize) -> (Self, Self::RxHalf) {
        RingBuffer::bounded(cap)
    }
}
