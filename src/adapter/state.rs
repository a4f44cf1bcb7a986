//! Adapter sync state and its transition rules.
//!
//! `SyncStateMachine` is the single authority over an adapter's `AdapterState`. Every input (an
//! explicit `start()`, an engine callback, a disconnect) goes through one method here, which returns
//! the new state only when the state actually changed. Callers publish exactly what comes back, so
//! a state-changed event fires at most once per transition.
//!
//! A "run" is one continuous stretch of `Syncing`. Progress is non-decreasing within a run: a
//! lower or repeated value is dropped. Leaving `Syncing` ends the run, and so does the engine
//! reporting a new run (a reorg) after progress was recorded: that restarts progress at zero.
//!
//! After a disconnect the machine stops accepting engine data until the adapter resumes it (a new
//! `start()`) or the engine reports a fresh sync. Anything the engine sends in between came from
//! the failed session and is discarded.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum AdapterState {
	Synced,
	Syncing { progress: Option<f64> },
	NotSynced,
}

impl AdapterState {
	pub fn is_syncing(&self) -> bool {
		matches!(self, AdapterState::Syncing { .. })
	}

	pub fn progress(&self) -> Option<f64> {
		match self {
			AdapterState::Syncing { progress } => *progress,
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SyncStateMachine {
	state: AdapterState,
	accepting_data: bool,
	runs: u64,
}

impl Default for SyncStateMachine {
	fn default() -> Self {
		Self::new()
	}
}

impl SyncStateMachine {
	pub fn new() -> Self {
		Self {
			state: AdapterState::NotSynced,
			accepting_data: true,
			runs: 0,
		}
	}

	pub fn state(&self) -> AdapterState {
		self.state
	}

	/// Whether engine data (balance, height, records) belongs to the current session.
	pub fn accepts_data(&self) -> bool {
		self.accepting_data
	}

	/// Number of sync runs entered so far.
	pub fn runs(&self) -> u64 {
		self.runs
	}

	fn enter_run(&mut self, progress: f64) -> Option<AdapterState> {
		self.runs += 1;
		self.set(AdapterState::Syncing {
			progress: Some(progress),
		})
	}

	fn set(&mut self, state: AdapterState) -> Option<AdapterState> {
		if self.state == state {
			return None;
		}
		self.state = state;
		Some(state)
	}

	/// Explicit `start()`. Only leaves `NotSynced`; anything else is coalesced.
	pub fn begin(&mut self) -> Option<AdapterState> {
		match self.state {
			AdapterState::NotSynced => self.enter_run(0.0),
			_ => None,
		}
	}

	/// Data after this point belongs to a new session.
	pub fn resume(&mut self) {
		self.accepting_data = true;
	}

	/// Engine reports a new run (fresh trigger or reorg).
	///
	/// Joins a run that has not recorded progress yet, such as the one `begin()` just opened.
	pub fn sync_started(&mut self) -> Option<AdapterState> {
		self.accepting_data = true;
		match self.state {
			AdapterState::Syncing { progress } if progress.unwrap_or(0.0) <= 0.0 => None,
			_ => self.enter_run(0.0),
		}
	}

	pub fn progress(&mut self, progress: f64) -> Option<AdapterState> {
		if !self.accepting_data || !progress.is_finite() {
			return None;
		}
		let progress = progress.clamp(0.0, 1.0);

		match self.state {
			AdapterState::Syncing { progress: current } => {
				if current.is_some_and(|current| progress <= current) {
					return None;
				}
				self.set(AdapterState::Syncing {
					progress: Some(progress),
				})
			}
			// Progress without a prior start is a fresh run driven by the engine.
			AdapterState::Synced | AdapterState::NotSynced => self.enter_run(progress),
		}
	}

	pub fn completed(&mut self) -> Option<AdapterState> {
		if !self.accepting_data {
			return None;
		}
		self.set(AdapterState::Synced)
	}

	pub fn disconnected(&mut self) -> Option<AdapterState> {
		self.accepting_data = false;
		self.set(AdapterState::NotSynced)
	}

	/// Back to `NotSynced` after the wallet's data was wiped. Engine data stays gated until the
	/// next `start()` or engine sync.
	pub fn reset(&mut self) -> Option<AdapterState> {
		self.accepting_data = false;
		self.set(AdapterState::NotSynced)
	}
}
