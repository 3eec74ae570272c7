//! Cooperative cancellation built on a `tokio::sync::watch` channel.
//!
//! - `CancelHandle` は実行を止める側が持つ（キャンセル要求を受けたエンジン、期限タイマー）
//! - `CancelToken` は StageRunner と NodeWorkerPool を経由して各リモートコマンドまで clone され、
//!   次の await 地点で観測される

use std::fmt;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// An external cancel request, with the caller's reason.
    Requested(String),
    /// The run's deadline passed.
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested(reason) if reason.is_empty() => f.write_str("cancelled"),
            CancelReason::Requested(reason) => write!(f, "cancelled: {reason}"),
            CancelReason::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

/// Sending side. Dropping it without cancelling leaves tokens un-cancelled.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<CancelReason>>,
}

/// Receiving side, cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(None);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Signal cancellation. The first reason wins; returns `false` if the
    /// handle was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.rx.borrow().clone()
    }

    /// Resolves once cancelled. Pends forever if the handle is dropped first.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        // Clone out of the borrow so no `watch::Ref` lives across an await.
        let fired = rx.wait_for(Option::is_some).await.map(|reason| reason.clone());
        match fired {
            Ok(reason) => reason.unwrap_or(CancelReason::Deadline),
            Err(_) => std::future::pending().await,
        }
    }
}
