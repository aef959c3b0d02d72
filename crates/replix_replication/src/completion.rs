//! One-shot completion signal that many waiters can observe.

use tokio::sync::watch;

/// Completes a [`Completion`].
#[derive(Debug)]
pub(crate) struct CompletionSender {
    tx: watch::Sender<bool>,
}

impl CompletionSender {
    pub(crate) fn complete(self) {
        let _ = self.tx.send(true);
    }
}

/// Resolves once the matching [`CompletionSender`] completes or is dropped.
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    rx: watch::Receiver<bool>,
}

impl Completion {
    /// A completion that has already happened.
    pub(crate) fn done() -> Self {
        let (tx, completion) = completion();
        tx.complete();
        completion
    }

    #[cfg(test)]
    fn is_done(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    pub(crate) async fn wait(mut self) {
        // A dropped sender counts as completion.
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

pub(crate) fn completion() -> (CompletionSender, Completion) {
    let (tx, rx) = watch::channel(false);
    (CompletionSender { tx }, Completion { rx })
}
