//! Cooperative cancellation for long-running deploy operations.
//!
//! A [`CancelToken`] is checked at the blocking points of a deploy: external
//! command execution, the pod-recycle readiness poll, and plan step
//! boundaries. Cancellation is sticky: once cancelled, a token stays
//! cancelled.

use tokio::sync::watch;

/// The sending half of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelHandle {
  tx: watch::Sender<bool>,
}

impl CancelHandle {
  /// Signal cancellation to every associated [`CancelToken`].
  pub fn cancel(&self) {
    let _ = self.tx.send(true);
  }
}

/// The receiving half of a cancellation pair.
///
/// Cloneable; all clones observe the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
  rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
  /// A token that is never cancelled.
  pub fn none() -> CancelToken {
    CancelToken { rx: None }
  }

  /// Check whether cancellation has been requested.
  pub fn is_cancelled(&self) -> bool {
    self.rx.as_ref().is_some_and(|rx| *rx.borrow())
  }

  /// Wait until cancellation is requested.
  ///
  /// Never resolves for a token created with [`CancelToken::none`], or when
  /// the handle was dropped without cancelling.
  pub async fn cancelled(&self) {
    let Some(rx) = &self.rx else {
      std::future::pending::<()>().await;
      unreachable!()
    };

    let mut rx = rx.clone();
    loop {
      if *rx.borrow() {
        return;
      }
      if rx.changed().await.is_err() {
        // Handle dropped without cancelling; treat as never-cancelled.
        std::future::pending::<()>().await;
      }
    }
  }
}

/// Create a connected handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
  let (tx, rx) = watch::channel(false);
  (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn none_token_is_never_cancelled() {
    let token = CancelToken::none();
    assert!(!token.is_cancelled());
  }

  #[test]
  fn cancel_is_observed_by_all_clones() {
    let (handle, token) = cancel_pair();
    let other = token.clone();

    assert!(!token.is_cancelled());
    handle.cancel();
    assert!(token.is_cancelled());
    assert!(other.is_cancelled());
  }

  #[tokio::test]
  async fn cancelled_wait_resolves_after_cancel() {
    let (handle, token) = cancel_pair();

    let waiter = tokio::spawn(async move {
      token.cancelled().await;
    });

    handle.cancel();
    waiter.await.unwrap();
  }

  #[tokio::test]
  async fn cancelled_wait_resolves_when_already_cancelled() {
    let (handle, token) = cancel_pair();
    handle.cancel();
    token.cancelled().await;
  }
}
