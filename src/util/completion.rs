use futures::channel::oneshot;

use crate::error::{cancelled, SyncError, SyncResult};

/// Creates a write-once completion and the handle that awaits it.
pub fn completion_pair() -> (Completion, CompletionHandle) {
    let (sender, receiver) = oneshot::channel();
    (Completion { sender }, CompletionHandle { receiver })
}

/// Write-once container carrying success or an error to exactly one waiter.
/// Consuming methods make double-resolution unrepresentable.
#[derive(Debug)]
pub struct Completion {
    sender: oneshot::Sender<SyncResult<()>>,
}

impl Completion {
    pub fn resolve(self) {
        let _ = self.sender.send(Ok(()));
    }

    pub fn reject(self, error: SyncError) {
        let _ = self.sender.send(Err(error));
    }

    pub fn complete(self, result: SyncResult<()>) {
        let _ = self.sender.send(result);
    }
}

/// Awaits the paired [`Completion`]. Dropping the completion without
/// resolving it surfaces as CANCELLED.
#[derive(Debug)]
pub struct CompletionHandle {
    receiver: oneshot::Receiver<SyncResult<()>>,
}

impl CompletionHandle {
    pub async fn wait(self) -> SyncResult<()> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("completion dropped before resolution")),
        }
    }

    /// Non-blocking probe used by tests: `None` while unresolved.
    pub fn try_result(&mut self) -> Option<SyncResult<()>> {
        self.receiver.try_recv().ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{internal_error, ErrorCode};

    #[tokio::test]
    async fn resolves_once_with_success() {
        let (completion, handle) = completion_pair();
        completion.resolve();
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn rejection_carries_the_error() {
        let (completion, handle) = completion_pair();
        completion.reject(internal_error("boom"));
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn dropped_completion_reports_cancelled() {
        let (completion, handle) = completion_pair();
        drop(completion);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
    }
}
