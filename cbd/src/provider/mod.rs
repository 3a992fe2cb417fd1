//! Provider gateway
//!
//! The telephony seam: one `Provider` trait, two backends (hosted REST,
//! PBX manager protocol), selected once at startup from config.

use std::sync::Arc;

use tracing::debug;

mod error;
pub mod gateway;
mod hosted;
mod pbx;

pub use error::ProviderError;
pub use gateway::{DispatchReceipt, Provider};
pub use hosted::HostedProvider;
pub use pbx::PbxProvider;

use crate::config::Config;

/// Create the provider selected by `provider.kind`
///
/// Reads credentials from the environment at construction time; a missing
/// credential surfaces here, before any dispatch is attempted.
pub fn create_provider(config: &Config) -> Result<Arc<dyn Provider>, ProviderError> {
    debug!(kind = %config.provider.kind, "create_provider: called");
    match config.provider.kind.as_str() {
        "hosted" => {
            debug!("create_provider: creating hosted client");
            Ok(Arc::new(HostedProvider::from_config(&config.hosted)?))
        }
        "pbx" => {
            debug!("create_provider: creating pbx client");
            Ok(Arc::new(PbxProvider::from_config(&config.pbx)?))
        }
        other => {
            debug!(kind = %other, "create_provider: unknown provider kind");
            Err(ProviderError::NotConfigured(format!(
                "Unknown provider kind: '{}'. Supported: hosted, pbx",
                other
            )))
        }
    }
}
