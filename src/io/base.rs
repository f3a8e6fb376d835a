use crate::error::{RecvError, SendError, TryRecvError};
use crate::utils::CancelToken;
use std::time::Duration;

/// Base trait for sending typed items.
///
/// Implemented by channel senders (TX half).
pub trait BaseTx: Send + 'static {
    /// Item type carried by this channel.
    type ItemType: Send + 'static;

    /// Non-blocking send. Returns `Err` if the channel is full or disconnected.
    fn try_send(&mut self, a: Self::ItemType) -> Result<(), SendError<Self::ItemType>>;

    /// Blocking/cooperative send with optional timeout and cancellation.
    fn send(
        &mut self,
        a: Self::ItemType,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<Self::ItemType>>;
}

/// Base trait for receiving typed items.
///
/// Implemented by channel receivers (RX half).
pub trait BaseRx: Send + 'static {
    /// Item type carried by this channel.
    type ItemType: Send + 'static;

    /// Non-blocking receive. Returns `Empty` if no data, `Disconnected` if closed.
    fn try_recv(&mut self) -> Result<Self::ItemType, TryRecvError>;

    /// Blocking/cooperative receive with optional timeout and cancellation.
    fn recv(
        &mut self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<Self::ItemType, RecvError>;

    /// Drain up to `max` items from the channel (capped at 64).
    fn drain(&mut self, max: usize) -> Vec<Self::ItemType> {
        let max = max.min(64);
        let mut out = Vec::with_capacity(max);

        for _ in 0..max {
            match self.try_recv() {
                Ok(a) => out.push(a),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

/// Extension for RX halves that can create paired TX halves.
pub trait RxPairExt: BaseRx + Sized {
    type TxHalf: BaseTx<ItemType = Self::ItemType>;

    /// Create a bounded channel with the given capacity.
    fn bound(cap: usize) -> (Self::TxHalf, Self);
}

/// Extension for TX halves that can create paired RX halves.
pub trait TxPairExt: BaseTx + Sized {
    type RxHalf: BaseRx<ItemType = Self::ItemType>;

    /// Create a bounded channel with the given capacity.
    fn bound(cap: usize) -> (Self, Self::RxHalf);
}
