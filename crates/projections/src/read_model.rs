//! Read model trait for query-side views.

/// A read model providing query access to data folded from the log.
///
/// Read models are rebuilt from committed transactions and never written to
/// by command handlers.
pub trait ReadModel: Send + Sync {
    /// Returns the name of this read model.
    fn name(&self) -> &'static str;

    /// Returns the number of avatars this read model holds entries for.
    fn count(&self) -> usize;
}
