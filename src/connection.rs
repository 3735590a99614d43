use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use crate::error::HarnessError;
#[cfg(feature = "file-upload")]
use crate::transport::UploadResult;
use crate::transport::{ConnectionStatus, ConnectionStatusReason};

/// Whether an upload reported success
#[cfg(feature = "file-upload")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOutcome {
    ///
    pub success: bool,
}

/// Shared per-test record of connection and upload state
///
/// Clones observe and update the same record. Transport events write it through
/// [`on_status_changed`](Self::on_status_changed) and
/// [`on_upload_complete`](Self::on_upload_complete); the test sequence waits on it.
/// Writers never block.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    #[cfg(feature = "file-upload")]
    upload: Arc<watch::Sender<Option<UploadOutcome>>>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    ///
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Unauthenticated);
        #[cfg(feature = "file-upload")]
        let (upload, _) = watch::channel(None);
        Self {
            status: Arc::new(status),
            #[cfg(feature = "file-upload")]
            upload: Arc::new(upload),
        }
    }

    /// Back to unauthenticated with no upload outcome
    pub fn reset(&self) {
        self.status.send_replace(ConnectionStatus::Unauthenticated);
        #[cfg(feature = "file-upload")]
        self.upload.send_replace(None);
    }

    /// Record a status reported by the transport.
    ///
    /// Only reports with [`ConnectionStatusReason::Ok`] are recorded.
    pub fn on_status_changed(&self, status: ConnectionStatus, reason: ConnectionStatusReason) {
        if reason != ConnectionStatusReason::Ok {
            debug!("Ignoring connection status {:?} ({:?})", status, reason);
            return;
        }
        trace!("Connection status is now {:?}", status);
        self.status.send_replace(status);
    }

    /// Last recorded status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Wait until the transport has reported [`ConnectionStatus::Authenticated`]
    pub async fn wait_until_authenticated(&self, timeout: Duration) -> crate::Result<()> {
        let mut rx = self.status.subscribe();
        let authenticated = async {
            rx.wait_for(|s| *s == ConnectionStatus::Authenticated)
                .await
                .map(|_| ())
        };
        let waited = time::timeout(timeout, authenticated).await;
        match waited {
            Ok(Ok(())) => Ok(()),
            // the sender lives in self, it cannot be dropped while we wait
            Ok(Err(_)) => Err(HarnessError::Setup("connection monitor closed".into())),
            Err(_) => Err(HarnessError::Timeout {
                operation: "device authentication",
                after: timeout,
            }),
        }
    }

    /// Record the outcome of an upload. Later reports for the same attempt are dropped.
    #[cfg(feature = "file-upload")]
    pub fn on_upload_complete(&self, result: UploadResult) {
        let outcome = UploadOutcome {
            success: result == UploadResult::Ok,
        };
        let recorded = self.upload.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
        if recorded {
            info!("Upload completed with {:?}", result);
        } else {
            warn!("Dropping duplicate upload completion {:?}", result);
        }
    }

    /// Outcome of the upload, if one has completed
    #[cfg(feature = "file-upload")]
    pub fn upload_outcome(&self) -> Option<UploadOutcome> {
        *self.upload.borrow()
    }

    /// Wait for an upload to report its outcome
    #[cfg(feature = "file-upload")]
    pub async fn wait_for_upload(&self, timeout: Duration) -> crate::Result<UploadOutcome> {
        let mut rx = self.upload.subscribe();
        // copy the outcome out so no borrow of the receiver outlives it
        let completed = async { rx.wait_for(Option::is_some).await.map(|outcome| *outcome) };
        let waited = time::timeout(timeout, completed).await;
        match waited {
            Ok(Ok(Some(outcome))) => Ok(outcome),
            Ok(Ok(None)) => Err(HarnessError::Setup("upload outcome vanished".into())),
            Ok(Err(_)) => Err(HarnessError::Setup("connection monitor closed".into())),
            Err(_) => Err(HarnessError::Timeout {
                operation: "upload completion",
                after: timeout,
            }),
        }
    }
}
