// ── Filter predicates for provider snapshots ──
//
// Used by readers to narrow a snapshot without walking it by hand.

use super::snapshot::ProviderSnapshot;

/// Filter predicate for provider snapshots.
pub enum ProviderFilter {
    All,
    ByModel(String),
    ByName(String),
    HasService(String),
    /// Resource exists and has been written at least once.
    HasValue {
        service: String,
        resource: String,
    },
    LinkedTo(String),
    Custom(Box<dyn Fn(&ProviderSnapshot) -> bool + Send + Sync>),
}

impl ProviderFilter {
    pub fn matches(&self, provider: &ProviderSnapshot) -> bool {
        match self {
            Self::All => true,
            Self::ByModel(model) => provider.model == *model,
            Self::ByName(name) => provider.name == *name,
            Self::HasService(service) => provider.service(service).is_some(),
            Self::HasValue { service, resource } => provider
                .resource(service, resource)
                .is_some_and(|r| r.is_set()),
            Self::LinkedTo(child) => provider.linked.iter().any(|l| l == child),
            Self::Custom(f) => f(provider),
        }
    }
}

impl std::fmt::Debug for ProviderFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::ByModel(m) => f.debug_tuple("ByModel").field(m).finish(),
            Self::ByName(n) => f.debug_tuple("ByName").field(n).finish(),
            Self::HasService(s) => f.debug_tuple("HasService").field(s).finish(),
            Self::HasValue { service, resource } => f
                .debug_struct("HasValue")
                .field("service", service)
                .field("resource", resource)
                .finish(),
            Self::LinkedTo(c) => f.debug_tuple("LinkedTo").field(c).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
