use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// A task tracker paired with the cancellation token every task spawned on
/// it is expected to select on. One handle is owned per subsystem instance;
/// cloning shares both the tracker and the token.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// The tracker to spawn tracked tasks on.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// A clone of the shared exit signal.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel all tracked tasks and wait for their completion.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
