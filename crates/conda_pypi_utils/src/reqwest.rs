use std::{sync::Arc, time::Duration};

use conda_pypi_config::Config;
use miette::IntoDiagnostic;
use rattler_networking::{
    AuthenticationMiddleware, AuthenticationStorage,
    authentication_storage::backends::file::FileStorage,
};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use url::Url;

/// Hosts of the public PyPI index, requests to them are never authenticated.
const PUBLIC_INDEX_HOSTS: [&str; 2] = ["pypi.org", "files.pythonhosted.org"];

/// The default retry policy used for every request made by conda-pypi.
pub fn default_retry_policy() -> ExponentialBackoff {
    ExponentialBackoff::builder().build_with_max_retries(3)
}

/// Whether `url` points at an index other than the public PyPI.
pub fn is_private_index(url: &Url) -> bool {
    url.host_str().is_some_and(|host| {
        !PUBLIC_INDEX_HOSTS
            .iter()
            .any(|public| host.eq_ignore_ascii_case(public))
    })
}

/// The credential store for the configured override file, or the rattler
/// defaults (`RATTLER_AUTH_FILE` and `~/.rattler/credentials.json`).
fn auth_storage(config: &Config) -> miette::Result<AuthenticationStorage> {
    if let Some(auth_file) = config.authentication_override_file() {
        tracing::info!("Loading authentication from file: {:?}", auth_file);

        if !auth_file.exists() {
            tracing::warn!("Authentication file does not exist: {:?}", auth_file);
        }

        let mut storage = AuthenticationStorage::empty();
        storage.add_backend(Arc::from(
            FileStorage::from_path(auth_file.clone()).into_diagnostic()?,
        ));
        return Ok(storage);
    }

    AuthenticationStorage::from_env_and_defaults().into_diagnostic()
}

/// Builds the plain client and a client that authenticates requests and
/// retries transient failures.
///
/// The global config is loaded when no config is given.
pub fn build_reqwest_clients(
    config: Option<&Config>,
) -> miette::Result<(Client, ClientWithMiddleware)> {
    static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

    let config = match config {
        Some(config) => config.clone(),
        None => Config::load_global(),
    };

    if config.tls_no_verify() {
        tracing::warn!(
            "TLS verification is disabled. This is insecure and should only be used for testing or internal networks."
        );
    }

    let timeout = 5 * 60;
    let client = Client::builder()
        .pool_max_idle_per_host(20)
        .user_agent(APP_USER_AGENT)
        .danger_accept_invalid_certs(config.tls_no_verify())
        .read_timeout(Duration::from_secs(timeout))
        .build()
        .into_diagnostic()?;

    let storage = auth_storage(&config)?;
    for index_url in config.pypi_config().index_urls() {
        if !is_private_index(&index_url) {
            continue;
        }
        match storage.get_by_url(index_url.clone()) {
            Ok((_, Some(_))) => tracing::debug!("using stored credentials for {index_url}"),
            _ => tracing::debug!("no credentials stored for private index {index_url}"),
        }
    }

    let retrying_client = ClientBuilder::new(client.clone())
        .with(RetryTransientMiddleware::new_with_policy(
            default_retry_policy(),
        ))
        .with(PublicIndexGuard(
            AuthenticationMiddleware::from_auth_storage(storage),
        ))
        .build();

    Ok((client, retrying_client))
}

/// Only lets the wrapped authentication middleware see requests to private
/// indexes, so tokens never leak to the public PyPI hosts.
struct PublicIndexGuard(AuthenticationMiddleware);

#[async_trait::async_trait]
impl Middleware for PublicIndexGuard {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        if is_private_index(req.url()) {
            self.0.handle(req, extensions, next).await
        } else {
            next.run(req, extensions).await
        }
    }
}
