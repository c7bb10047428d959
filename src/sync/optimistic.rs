use crate::errors::AppError;
use crate::models::Todo;
use crate::sync::view::{LocalChange, Snapshot, ViewCell};
use std::future::Future;

#[derive(Debug)]
pub(crate) enum Optimistic {
    /// The remote call succeeded; carries what the local change replaced.
    Applied(Snapshot),
    Reverted(AppError),
    Skipped,
}

/// Applies a local change right away, then confirms it remotely.
///
/// `plan` sees the current record and picks the change (or `None` to skip).
/// `remote` receives that change and performs the matching store call. On
/// failure the replaced state is written back, unless the session changed
/// while the call was in flight.
pub(crate) async fn run<P, R, Fut>(view: &ViewCell, id: &str, plan: P, remote: R) -> Optimistic
where
    P: FnOnce(&Todo) -> Option<LocalChange>,
    R: FnOnce(LocalChange) -> Fut,
    Fut: Future<Output = Result<(), AppError>>,
{
    let applied = view.mutate(|view| {
        let epoch = view.epoch();
        let change = plan(view.get(id)?)?;
        let snapshot = view.apply_local(id, &change)?;
        Some((epoch, change, snapshot))
    });
    let Some((epoch, change, snapshot)) = applied else {
        return Optimistic::Skipped;
    };
    tracing::debug!(todo_id = %id, change = ?change, "optimistic change applied");

    match remote(change).await {
        Ok(()) => Optimistic::Applied(snapshot),
        Err(error) => {
            let restored = view.mutate(|view| view.epoch() == epoch && view.restore(id, snapshot));
            tracing::warn!(todo_id = %id, error = %error, restored, "remote write failed, local change reverted");
            Optimistic::Reverted(error)
        }
    }
}
