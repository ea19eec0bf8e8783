use tokio::sync::{broadcast, mpsc};

/// Shutdown signal with completion tracking. Every long-lived task holds a
/// `Receiver`; `Sender::send` broadcasts the signal and returns a waiter
/// that resolves once every receiver has been dropped, i.e. once every
/// task has finished its cleanup.
pub fn channel() -> (Sender, Receiver) {
    let (broadcast_tx, _) = broadcast::channel(1);

    let (alive_tx, alive_rx) = mpsc::channel(1);
    let waiter = FinishedTasksWaiter(alive_rx);

    let sender = Sender {
        sender: broadcast_tx.clone(),
        waiter,
    };
    let receiver = Receiver {
        receiver: broadcast_tx.subscribe(),
        sender: broadcast_tx,
        alive_marker: alive_tx,
    };

    (sender, receiver)
}

pub struct FinishedTasksWaiter(mpsc::Receiver<()>);

impl FinishedTasksWaiter {
    pub async fn wait(mut self) {
        let _ = self.0.recv().await;
    }
}

pub struct Sender {
    sender: broadcast::Sender<()>,
    waiter: FinishedTasksWaiter,
}

impl Sender {
    pub fn send(self) -> FinishedTasksWaiter {
        let _ = self.sender.send(());
        self.waiter
    }
}

#[derive(Debug)]
pub struct Receiver {
    sender: broadcast::Sender<()>,
    receiver: broadcast::Receiver<()>,
    alive_marker: mpsc::Sender<()>,
}

impl Receiver {
    pub async fn recv(&mut self) {
        // a dropped sender counts as a shutdown signal
        let _ = self.receiver.recv().await;
    }
}

impl Clone for Receiver {
    fn clone(&self) -> Self {
        Self {
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
            alive_marker: self.alive_marker.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::channel;

    #[tokio::test]
    async fn waits_for_all_receivers() {
        let (tx, rx) = channel();
        let rx_clone = rx.clone();

        let task = tokio::spawn(async move {
            let mut rx = rx_clone;
            rx.recv().await;
        });

        drop(rx);
        tx.send().wait().await;

        task.await.unwrap();
    }
}
