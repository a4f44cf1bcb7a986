//! Event bus for adapter notifications.
//!
//! Each adapter owns one `EventBus` with four independent broadcast channels: balance, state,
//! last block height, and transaction records. The adapter is the only producer. Every subscriber
//! gets its own copy of every event, in the order the adapter published them.
//!
//! Publishing never waits on subscribers. Channels are bounded; a subscriber that falls more than
//! `capacity` events behind sees `BusError::Lagged` and skips ahead, while everyone else keeps
//! receiving normally. There is no replay: a new subscription starts with the next event, so
//! callers read the adapter's current values when they subscribe.

use crate::adapter::records::TransactionRecord;
use crate::adapter::state::AdapterState;

use thiserror::Error;
use tokio::sync::broadcast;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
	#[error("Subscriber lagged and missed {0} events")]
	Lagged(u64),

	#[error("Event channel closed")]
	Closed,
}

/// Events an adapter publishes.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
	BalanceChanged(u64),
	StateChanged(AdapterState),
	/// `None` after a wipe.
	LastBlockHeightChanged(Option<u64>),
	/// Changed records; empty after a wipe.
	TransactionRecordsChanged(Vec<TransactionRecord>),
}

/// One subscriber's view of a channel.
#[derive(Debug)]
pub struct Subscription<T> {
	rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
	pub(crate) fn new(rx: broadcast::Receiver<T>) -> Self {
		Self { rx }
	}

	/// Wait for the next event.
	pub async fn recv(&mut self) -> Result<T, BusError> {
		self.rx.recv().await.map_err(|e| match e {
			broadcast::error::RecvError::Lagged(n) => BusError::Lagged(n),
			broadcast::error::RecvError::Closed => BusError::Closed,
		})
	}

	/// Next event if one is already queued.
	pub fn try_recv(&mut self) -> Option<Result<T, BusError>> {
		match self.rx.try_recv() {
			Ok(value) => Some(Ok(value)),
			Err(broadcast::error::TryRecvError::Empty) => None,
			Err(broadcast::error::TryRecvError::Lagged(n)) => Some(Err(BusError::Lagged(n))),
			Err(broadcast::error::TryRecvError::Closed) => Some(Err(BusError::Closed)),
		}
	}
}

pub struct EventBus {
	balance: broadcast::Sender<u64>,
	state: broadcast::Sender<AdapterState>,
	last_block_height: broadcast::Sender<Option<u64>>,
	transaction_records: broadcast::Sender<Vec<TransactionRecord>>,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_CHANNEL_CAPACITY)
	}
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			balance: broadcast::channel(capacity).0,
			state: broadcast::channel(capacity).0,
			last_block_height: broadcast::channel(capacity).0,
			transaction_records: broadcast::channel(capacity).0,
		}
	}

	/// Publish an event to every current subscriber of its channel.
	///
	/// Having no subscribers is not an error.
	pub fn publish(&self, event: AdapterEvent) {
		let delivered = match event {
			AdapterEvent::BalanceChanged(balance) => self.balance.send(balance).ok(),
			AdapterEvent::StateChanged(state) => self.state.send(state).ok(),
			AdapterEvent::LastBlockHeightChanged(height) => {
				self.last_block_height.send(height).ok()
			}
			AdapterEvent::TransactionRecordsChanged(records) => {
				self.transaction_records.send(records).ok()
			}
		};
		tracing::trace!("Published adapter event to {} subscribers", delivered.unwrap_or(0));
	}

	pub fn subscribe_balance(&self) -> Subscription<u64> {
		Subscription::new(self.balance.subscribe())
	}

	pub fn subscribe_state(&self) -> Subscription<AdapterState> {
		Subscription::new(self.state.subscribe())
	}

	pub fn subscribe_last_block_height(&self) -> Subscription<Option<u64>> {
		Subscription::new(self.last_block_height.subscribe())
	}

	pub fn subscribe_transaction_records(&self) -> Subscription<Vec<TransactionRecord>> {
		Subscription::new(self.transaction_records.subscribe())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn every_subscriber_gets_every_event_in_order() {
		let bus = EventBus::default();
		let mut a = bus.subscribe_balance();
		let mut b = bus.subscribe_balance();

		for balance in [10, 20, 30] {
			bus.publish(AdapterEvent::BalanceChanged(balance));
		}

		for sub in [&mut a, &mut b] {
			assert_eq!(sub.recv().await, Ok(10));
			assert_eq!(sub.recv().await, Ok(20));
			assert_eq!(sub.recv().await, Ok(30));
			assert!(sub.try_recv().is_none());
		}
	}

	#[tokio::test]
	async fn late_subscriber_gets_no_replay() {
		let bus = EventBus::default();
		bus.publish(AdapterEvent::LastBlockHeightChanged(Some(100)));

		let mut late = bus.subscribe_last_block_height();
		assert!(late.try_recv().is_none());

		bus.publish(AdapterEvent::LastBlockHeightChanged(Some(101)));
		assert_eq!(late.recv().await, Ok(Some(101)));
	}

	#[tokio::test]
	async fn channels_are_independent() {
		let bus = EventBus::default();
		let mut balance = bus.subscribe_balance();
		let mut state = bus.subscribe_state();

		bus.publish(AdapterEvent::StateChanged(AdapterState::Synced));
		assert!(balance.try_recv().is_none());
		assert_eq!(state.recv().await, Ok(AdapterState::Synced));
	}

	#[tokio::test]
	async fn slow_subscriber_lags_without_blocking_others() {
		let bus = EventBus::new(2);
		let mut slow = bus.subscribe_balance();
		let mut fast = bus.subscribe_balance();

		for balance in 0..5u64 {
			bus.publish(AdapterEvent::BalanceChanged(balance));
			assert_eq!(fast.recv().await, Ok(balance));
		}

		assert_eq!(slow.recv().await, Err(BusError::Lagged(3)));
		assert_eq!(slow.recv().await, Ok(3));
		assert_eq!(slow.recv().await, Ok(4));
	}

	#[tokio::test]
	async fn closed_when_bus_dropped() {
		let bus = EventBus::default();
		let mut sub = bus.subscribe_transaction_records();
		drop(bus);
		assert_eq!(sub.recv().await, Err(BusError::Closed));
	}
}
