use tokio::sync::broadcast;

/// Cloneable signal used to ask long running tasks to stop.
pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
    rx: broadcast::Receiver<()>,
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = broadcast::channel(1);
        (ShutdownSender(tx.clone()), ShutdownSignal { tx, rx })
    }

    /// Resolves once the signal is sent.
    pub async fn recv(&mut self) {
        let _ = self.rx.recv().await;
    }
}

pub struct ShutdownSender(broadcast::Sender<()>);

impl ShutdownSender {
    pub fn send_signal(self) {
        let _ = self.0.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_clone_is_notified() {
        let (tx, mut signal) = ShutdownSignal::new();
        let mut other = signal.clone();
        tx.send_signal();
        signal.recv().await;
        other.recv().await;
    }
}
