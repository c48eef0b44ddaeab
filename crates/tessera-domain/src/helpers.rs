//! Callbacks injected into backends by the embedding application.

/// Services a backend needs but does not implement itself.
pub trait Helpers: Send + Sync + 'static {
    /// Mints a fresh object ID.
    fn next_id(&self) -> String;
}
