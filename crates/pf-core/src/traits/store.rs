//! App Store metadata lookup

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::StoreApp;

#[async_trait]
pub trait StoreLookup: Send + Sync {
    /// Resolve a bundle id in the given storefront country.
    ///
    /// Fails unless exactly one app matches.
    async fn lookup_bundle_id(&self, country: &str, bundle_id: &str) -> Result<StoreApp, StoreError>;
}
