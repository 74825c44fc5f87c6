use std::sync::Arc;

/// A channel sender paired with the main loop's waker, so that sends from
/// worker threads interrupt the poll.
pub struct WakingSender<T> {
    waker: Arc<mio::Waker>,
    sender: crossbeam_channel::Sender<T>,
}

impl<T> Clone for WakingSender<T> {
    fn clone(&self) -> Self {
        Self {
            waker: self.waker.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<T> WakingSender<T> {
    pub fn new(waker: Arc<mio::Waker>, sender: crossbeam_channel::Sender<T>) -> Self {
        assert!(
            !sender.is_full(),
            "WakingSender must be created with a non-zero capacity channel"
        );

        Self { waker, sender }
    }

    pub fn send(&self, msg: T) -> Result<(), crossbeam_channel::SendError<T>> {
        self.sender.send(msg)?;
        self.waker.wake().ok();
        Ok(())
    }
}
