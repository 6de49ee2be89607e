//! Stand-in [`sessions::ClientFactory`] for a workspace with no real
//! provider SDK to link against.

use std::sync::Arc;

use sdk::{MockProviderClient, ProviderClient, PublicLinkRegistry};
use sessions::ClientFactory;

/// Hands out [`MockProviderClient`] instances sharing one
/// [`PublicLinkRegistry`], so a cross-account transfer started by this
/// process can actually resolve an export from one mock account to an
/// import on another, the same role this registry plays in every other
/// crate's test suite.
pub(crate) struct DemoClientFactory {
    links: PublicLinkRegistry,
}

impl DemoClientFactory {
    pub(crate) fn new() -> Self {
        Self {
            links: PublicLinkRegistry::new(),
        }
    }
}

impl ClientFactory for DemoClientFactory {
    fn create_client(&self, account_id: &str) -> Arc<dyn ProviderClient> {
        Arc::new(MockProviderClient::new(account_id.to_string(), self.links.clone()))
    }
}
