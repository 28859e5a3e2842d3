use tokio::sync::watch;

/// Resolves once the shared shutdown/cancellation flag turns true. Never
/// resolves if the sender is gone without cancelling, so callers can race
/// it against real work in `select!`.
pub async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}
