//! Low-level synchronization primitives shared by the block cache and the dentry cache.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A short, rarely-contended critical section.
///
/// Used for per-page and per-dentry state that is held only long enough to flip a few flags,
/// never across I/O or blocking waits.
pub type SpinLock<T> = spin::Mutex<T>;

/// A generation-counter condition variable.
///
/// Unlike a plain condvar, waiters snapshot a generation number before releasing their lock and
/// only wake once the generation has advanced past what they observed, which avoids the lost
/// wakeup that a bare `notify` without a predicate is prone to when a signal arrives between the
/// unlock and the wait.
pub struct GenCondvar {
	generation: Mutex<u64>,
	condvar: Condvar,
}

impl Default for GenCondvar {
	fn default() -> Self {
		Self::new()
	}
}

impl GenCondvar {
	/// Creates a fresh condition variable at generation 0.
	pub fn new() -> Self {
		Self {
			generation: Mutex::new(0),
			condvar: Condvar::new(),
		}
	}

	/// Returns the current generation, to be passed to a later [`GenCondvar::wait_while`] call
	/// taken before releasing whatever lock guards the awaited state.
	pub fn generation(&self) -> u64 {
		*self.generation.lock()
	}

	/// Wakes one waiter and advances the generation.
	pub fn notify_one(&self) {
		let mut gen = self.generation.lock();
		*gen = gen.wrapping_add(1);
		self.condvar.notify_one();
	}

	/// Wakes all waiters and advances the generation.
	pub fn notify_all(&self) {
		let mut gen = self.generation.lock();
		*gen = gen.wrapping_add(1);
		self.condvar.notify_all();
	}

	/// Blocks until the generation advances past `since`.
	pub fn wait_for_change(&self, since: u64) {
		let mut gen = self.generation.lock();
		while *gen == since {
			self.condvar.wait(&mut gen);
		}
	}

}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn notify_wakes_waiter() {
		let cv = Arc::new(GenCondvar::new());
		let cv2 = cv.clone();
		let gen = cv.generation();
		let handle = thread::spawn(move || {
			cv2.wait_for_change(gen);
		});
		thread::sleep(Duration::from_millis(10));
		cv.notify_all();
		handle.join().unwrap();
	}
}
