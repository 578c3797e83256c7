//! Cooperative-cancellation and abort-on-drop task helpers shared by every
//! long-running loop in the broker (upstream client, agent acceptor,
//! listeners, periodic reporting).

use std::future::Future;

use tokio::task::JoinHandle;

/// Handed to the process entry point. Dropping or calling [`ShutdownHandle::signal`]
/// propagates cancellation to every [`ShutdownSignal`] clone.
#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    #[must_use]
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

/// Cloneable cancellation observer. `wait()` resolves once, the first time
/// the handle signals; further calls resolve immediately.
#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.has_changed().unwrap_or(true)
    }
}

/// Aborts the wrapped task when dropped, so a supervisor that stops caring
/// about a child does not leak it.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    /// Drop without aborting the task: it keeps running detached.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn shutdown_signal_wakes_all_clones() {
        let (handle, mut a) = ShutdownHandle::new();
        let mut b = a.clone();

        handle.signal();

        a.wait().await;
        b.wait().await;
    }

    #[tokio::test]
    async fn child_task_aborts_on_drop() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = ChildTask::spawn(async move {
            let _ = rx.await;
        });
        drop(task);
        // The sender side observes the receiver got dropped (task aborted).
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        assert!(tx.send(()).is_err());
    }
}
