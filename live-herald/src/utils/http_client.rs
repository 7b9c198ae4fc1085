use std::{sync::OnceLock, time::Duration};

use tracing::debug;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared `reqwest::Client` used by the REST collaborators.
///
/// A zero `request_timeout` leaves requests unbounded; the engine applies its
/// own per-call timeout on top.
pub fn build_client(request_timeout: Duration) -> reqwest::Client {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder().user_agent(concat!(
        "live-herald/",
        env!("CARGO_PKG_VERSION")
    ));
    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    match builder.build() {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        }
    }
}
