/// A broadcast pair used to signal shutdown to every task that holds a clone.
///
/// Clones subscribe at the time of cloning, so a clone only observes a shutdown sent after it
/// was created. Hand out clones before spawning the tasks that wait on them.
#[derive(Debug)]
pub struct Shutdown(
    tokio::sync::broadcast::Sender<()>,
    tokio::sync::broadcast::Receiver<()>,
);

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        Shutdown(tx, rx)
    }

    pub fn shutdown(&self) {
        // every instance holds a receiver, so the send can't fail
        let _ = self.0.send(());
    }

    /// Resolves once shutdown has been signalled.
    pub async fn wait(&mut self) {
        let _ = self.1.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Shutdown(self.0.clone(), self.0.subscribe())
    }
}
