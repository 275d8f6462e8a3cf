use tandem_xa::Status;

/// Callback around transaction completion.
///
/// `before_completion` runs only on the commit path, before prepare. A
/// failure marks the transaction rollback-only. `after_completion` always
/// runs, whatever the outcome.
pub trait Synchronization: Send + Sync {
    fn before_completion(&self) -> Result<(), String> {
        Ok(())
    }

    fn after_completion(&self, status: Status);
}
