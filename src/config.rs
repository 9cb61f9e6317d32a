use std::time::Duration;
use typed_builder::TypedBuilder;

/// Static parameters shared by every peer of one overlay.
#[derive(Debug, Clone, TypedBuilder)]
pub struct OverlayConfig {
    /// Number of axes of the key space. Quadruple-oriented deployments use
    /// one axis per quadruple term.
    #[builder(default = 4)]
    pub dimensions: usize,

    /// How long a peer remembers the ids of requests it has already received.
    /// Entries only matter while a traversal is in flight, so the window can
    /// be generous without the set growing unbounded.
    #[builder(default = Duration::from_secs(300))]
    pub dedup_ttl: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
