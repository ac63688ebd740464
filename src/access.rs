//! Capability check consulted before any open or close.

/// Decides whether the current caller may use the broker
pub trait AccessPolicy: Send + Sync {
    fn is_caller_authorized(&self) -> bool;
}

/// Policy for deployments where callers are vetted upstream
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_caller_authorized(&self) -> bool {
        true
    }
}

impl<F> AccessPolicy for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_caller_authorized(&self) -> bool {
        self()
    }
}
