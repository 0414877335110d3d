//! HTTP client setup shared by outbound senders.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another component may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build a client with the given request timeout.
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    install_rustls_provider();
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("carewatch/", env!("CARGO_PKG_VERSION")))
        .build()
}
