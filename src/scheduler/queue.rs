//! Bounded, two-priority admission queue for outbound calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::options::Priority;

struct QueueState {
  active: usize,
  high: VecDeque<oneshot::Sender<()>>,
  normal: VecDeque<oneshot::Sender<()>>,
}

impl QueueState {
  fn has_waiters(&self) -> bool {
    !self.high.is_empty() || !self.normal.is_empty()
  }
}

/// Admits at most `bound` holders at once. Waiters are served high priority
/// first, FIFO within a priority.
///
/// A released slot is handed directly to the next waiter, whose task resumes
/// on its own schedule rather than inside the releasing call.
pub struct RequestQueue {
  bound: usize,
  state: Mutex<QueueState>,
}

/// Proof of admission; the slot is released on drop.
pub struct QueueSlot {
  queue: Arc<RequestQueue>,
}

impl Drop for QueueSlot {
  fn drop(&mut self) {
    self.queue.release();
  }
}

/// A queued waiter. If it is dropped after a slot was handed over but before
/// it was observed, the slot is passed on instead of leaking.
struct Waiting {
  queue: Arc<RequestQueue>,
  rx: oneshot::Receiver<()>,
  admitted: bool,
}

impl Drop for Waiting {
  fn drop(&mut self) {
    if self.admitted {
      return;
    }
    self.rx.close();
    if self.rx.try_recv().is_ok() {
      self.queue.release();
    }
  }
}

impl RequestQueue {
  pub fn new(bound: usize) -> Self {
    Self {
      bound: bound.max(1),
      state: Mutex::new(QueueState {
        active: 0,
        high: VecDeque::new(),
        normal: VecDeque::new(),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn bound(&self) -> usize {
    self.bound
  }

  /// Holders currently admitted.
  pub fn active(&self) -> usize {
    self.state().active
  }

  /// Waiters not yet admitted.
  pub fn queued(&self) -> usize {
    let state = self.state();
    state.high.len() + state.normal.len()
  }

  /// Wait for a slot.
  pub async fn acquire(self: &Arc<Self>, priority: Priority) -> QueueSlot {
    loop {
      let rx = {
        let mut state = self.state();
        if state.active < self.bound && !state.has_waiters() {
          state.active += 1;
          return QueueSlot {
            queue: Arc::clone(self),
          };
        }
        let (tx, rx) = oneshot::channel();
        match priority {
          Priority::High => state.high.push_back(tx),
          Priority::Normal => state.normal.push_back(tx),
        }
        rx
      };

      let mut waiting = Waiting {
        queue: Arc::clone(self),
        rx,
        admitted: false,
      };
      if (&mut waiting.rx).await.is_ok() {
        waiting.admitted = true;
        return QueueSlot {
          queue: Arc::clone(self),
        };
      }
      // Sender vanished without handing over a slot; queue again
      waiting.admitted = true;
    }
  }

  /// Hand the slot to the next live waiter, or free it.
  fn release(&self) {
    let mut state = self.state();
    loop {
      let next = match state.high.pop_front() {
        Some(tx) => Some(tx),
        None => state.normal.pop_front(),
      };
      match next {
        Some(tx) => {
          if tx.send(()).is_ok() {
            return;
          }
          // Waiter was cancelled; try the next one
        }
        None => {
          state.active = state.active.saturating_sub(1);
          return;
        }
      }
    }
  }
}

impl std::fmt::Debug for RequestQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RequestQueue")
      .field("bound", &self.bound)
      .field("active", &self.active())
      .field("queued", &self.queued())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test(start_paused = true)]
  async fn test_bound_is_respected() {
    let queue = Arc::new(RequestQueue::new(2));
    let a = queue.acquire(Priority::Normal).await;
    let _b = queue.acquire(Priority::Normal).await;
    assert_eq!(queue.active(), 2);

    let q = queue.clone();
    let waiter = tokio::spawn(async move {
      let _slot = q.acquire(Priority::Normal).await;
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(queue.queued(), 1);
    assert_eq!(queue.active(), 2);

    drop(a);
    waiter.await.unwrap();
    assert_eq!(queue.queued(), 0);
    assert_eq!(queue.active(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_high_priority_overtakes_earlier_normal() {
    let queue = Arc::new(RequestQueue::new(1));
    let order = Arc::new(Mutex::new(Vec::new()));
    let blocker = queue.acquire(Priority::Normal).await;

    let mut handles = Vec::new();
    for (name, priority) in [
      ("A", Priority::Normal),
      ("B", Priority::Normal),
      ("C", Priority::High),
    ] {
      let q = queue.clone();
      let order = order.clone();
      handles.push(tokio::spawn(async move {
        let _slot = q.acquire(priority).await;
        order.lock().unwrap().push(name);
        tokio::time::sleep(Duration::from_millis(10)).await;
      }));
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(queue.queued(), 3);

    drop(blocker);
    for handle in handles {
      handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["C", "A", "B"]);
    assert_eq!(queue.active(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_waiter_does_not_leak_slot() {
    let queue = Arc::new(RequestQueue::new(1));
    let blocker = queue.acquire(Priority::Normal).await;

    let q = queue.clone();
    let cancelled = tokio::spawn(async move {
      let _slot = q.acquire(Priority::Normal).await;
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    cancelled.abort();
    let _ = cancelled.await;

    drop(blocker);
    assert_eq!(queue.active(), 0);
    let _again = queue.acquire(Priority::Normal).await;
    assert_eq!(queue.active(), 1);
  }
}
