//! Client options and their validation.
//!
//! [`ClientOptions`] is built with [`ClientOptionsBuilder`] and validated
//! when the connection is constructed. Authentication is exactly one of the
//! [`Auth`] families; host routing, wire format, retry policy and timeouts
//! all carry defaults matching the public service deployment.

use std::{fmt, sync::Arc, time::Duration};

use log::LevelFilter;

use crate::{
    auth::{AuthProvider, KeyAuth, TokenAuth},
    codec::WireFormat,
    connection::recovery::RecoverInfo,
    error::Error,
};

/// Authentication source for the connection handshake.
///
/// Exactly one family is chosen at construction. Callback- and URL-based
/// token sources are supplied as an [`AuthProvider`] implementation; the
/// token engine itself lives outside this crate.
#[derive(Clone)]
pub enum Auth {
    /// Direct API key, contributed as the `key` handshake parameter.
    Key(String),
    /// Literal token, contributed as the `access_token` handshake parameter.
    Token(String),
    /// Capability minting fresh parameters per open attempt.
    Provider(Arc<dyn AuthProvider>),
}

impl Auth {
    pub(crate) fn provider(&self) -> Arc<dyn AuthProvider> {
        match self {
            Self::Key(key) => Arc::new(KeyAuth(key.clone())),
            Self::Token(token) => Arc::new(TokenAuth(token.clone())),
            Self::Provider(provider) => Arc::clone(provider),
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(_) => f.write_str("Auth::Key(..)"),
            Self::Token(_) => f.write_str("Auth::Token(..)"),
            Self::Provider(_) => f.write_str("Auth::Provider(..)"),
        }
    }
}

/// Configuration for a realtime connection.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub(crate) auth: Auth,
    pub(crate) client_id: Option<String>,
    pub(crate) environment: Option<String>,
    pub(crate) realtime_host: Option<String>,
    pub(crate) fallback_hosts: Option<Vec<String>>,
    pub(crate) port: Option<u16>,
    pub(crate) tls: bool,
    pub(crate) echo_messages: bool,
    pub(crate) queue_messages: bool,
    pub(crate) format: WireFormat,
    pub(crate) recover: Option<String>,
    pub(crate) http_open_timeout: Duration,
    pub(crate) http_request_timeout: Duration,
    pub(crate) http_max_retry_count: u32,
    pub(crate) http_max_retry_duration: Duration,
    pub(crate) disconnected_retry_timeout: Duration,
    pub(crate) suspended_retry_timeout: Duration,
    pub(crate) max_disconnected_retries: u32,
    pub(crate) log_level: LevelFilter,
}

impl ClientOptions {
    /// Start building options with the given authentication source.
    #[must_use]
    pub fn builder(auth: Auth) -> ClientOptionsBuilder {
        ClientOptionsBuilder::new(auth)
    }

    /// Deadline for opening a transport to one host.
    #[must_use]
    pub fn http_open_timeout(&self) -> Duration {
        self.http_open_timeout
    }

    /// Deadline for a request/response exchange with the service.
    #[must_use]
    pub fn http_request_timeout(&self) -> Duration {
        self.http_request_timeout
    }

    /// Retry budget forwarded to the auth/REST collaborators.
    #[must_use]
    pub fn http_max_retry_count(&self) -> u32 {
        self.http_max_retry_count
    }

    /// Total retry duration granted to the auth/REST collaborators; also
    /// bounds the per-attempt auth parameter fetch.
    #[must_use]
    pub fn http_max_retry_duration(&self) -> Duration {
        self.http_max_retry_duration
    }

    /// Check option invariants that cannot be enforced by construction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a wildcard client id or a
    /// malformed recover key.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.client_id.as_deref() == Some("*") {
            return Err(Error::InvalidArgument(
                "client_id must not be the wildcard \"*\"".into(),
            ));
        }
        if let Some(recover) = &self.recover {
            RecoverInfo::parse(recover)?;
        }
        Ok(())
    }
}

/// Builder for [`ClientOptions`].
///
/// # Examples
///
/// ```
/// use livewire::{Auth, ClientOptions};
///
/// let options = ClientOptions::builder(Auth::Key("app.keyid:secret".into()))
///     .environment("sandbox")
///     .echo_messages(false)
///     .build();
/// ```
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    fn new(auth: Auth) -> Self {
        Self {
            options: ClientOptions {
                auth,
                client_id: None,
                environment: None,
                realtime_host: None,
                fallback_hosts: None,
                port: None,
                tls: true,
                echo_messages: true,
                queue_messages: true,
                format: WireFormat::default(),
                recover: None,
                http_open_timeout: Duration::from_secs(4),
                http_request_timeout: Duration::from_secs(10),
                http_max_retry_count: 3,
                http_max_retry_duration: Duration::from_secs(15),
                disconnected_retry_timeout: Duration::from_secs(15),
                suspended_retry_timeout: Duration::from_secs(30),
                max_disconnected_retries: 8,
                log_level: LevelFilter::Info,
            },
        }
    }

    /// Set the client identity; the wildcard `*` is rejected at validation.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.options.client_id = Some(client_id.into());
        self
    }

    /// Route to a named deployment; disables the default fallback pool.
    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.options.environment = Some(environment.into());
        self
    }

    /// Override the primary realtime host; disables the default fallback
    /// pool.
    #[must_use]
    pub fn realtime_host(mut self, host: impl Into<String>) -> Self {
        self.options.realtime_host = Some(host.into());
        self
    }

    /// Supply an explicit fallback host pool.
    #[must_use]
    pub fn fallback_hosts(mut self, hosts: Vec<String>) -> Self {
        self.options.fallback_hosts = Some(hosts);
        self
    }

    /// Override the port (defaults to 443 with TLS, 80 without).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = Some(port);
        self
    }

    /// Enable or disable TLS (default enabled).
    #[must_use]
    pub fn tls(mut self, tls: bool) -> Self {
        self.options.tls = tls;
        self
    }

    /// Whether the server echoes this connection's own messages back
    /// (default `true`).
    #[must_use]
    pub fn echo_messages(mut self, echo: bool) -> Self {
        self.options.echo_messages = echo;
        self
    }

    /// Whether `send` queues frames while not connected (default `true`).
    /// When disabled, sending outside `Connected` fails immediately.
    #[must_use]
    pub fn queue_messages(mut self, queue: bool) -> Self {
        self.options.queue_messages = queue;
        self
    }

    /// Select the wire format negotiated at the handshake.
    #[must_use]
    pub fn format(mut self, format: WireFormat) -> Self {
        self.options.format = format;
        self
    }

    /// Recover a connection from a previous process using its recovery key.
    /// Consumed by the first connect that reaches a terminal outcome.
    #[must_use]
    pub fn recover(mut self, recovery_key: impl Into<String>) -> Self {
        self.options.recover = Some(recovery_key.into());
        self
    }

    /// Deadline for opening a transport to one host.
    #[must_use]
    pub fn http_open_timeout(mut self, timeout: Duration) -> Self {
        self.options.http_open_timeout = timeout;
        self
    }

    /// Deadline for a request/response exchange (awaiting `Connected`, the
    /// close handshake).
    #[must_use]
    pub fn http_request_timeout(mut self, timeout: Duration) -> Self {
        self.options.http_request_timeout = timeout;
        self
    }

    /// Retry budget forwarded to the auth/REST collaborators.
    #[must_use]
    pub fn http_max_retry_count(mut self, count: u32) -> Self {
        self.options.http_max_retry_count = count;
        self
    }

    /// Total retry duration forwarded to the auth/REST collaborators.
    #[must_use]
    pub fn http_max_retry_duration(mut self, duration: Duration) -> Self {
        self.options.http_max_retry_duration = duration;
        self
    }

    /// Delay before retrying from `Disconnected` (default 15 s).
    #[must_use]
    pub fn disconnected_retry_timeout(mut self, timeout: Duration) -> Self {
        self.options.disconnected_retry_timeout = timeout;
        self
    }

    /// Delay between retries from `Suspended` (default 30 s).
    #[must_use]
    pub fn suspended_retry_timeout(mut self, timeout: Duration) -> Self {
        self.options.suspended_retry_timeout = timeout;
        self
    }

    /// Failed retries from `Disconnected` before escalating to `Suspended`
    /// (default 8).
    #[must_use]
    pub fn max_disconnected_retries(mut self, retries: u32) -> Self {
        self.options.max_disconnected_retries = retries;
        self
    }

    /// Maximum level emitted through the `log` facade.
    #[must_use]
    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.options.log_level = level;
        self
    }

    /// Finish building the options.
    #[must_use]
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn key_options() -> ClientOptionsBuilder {
        ClientOptions::builder(Auth::Key("app.keyid:secret".into()))
    }

    #[rstest]
    fn defaults_match_public_deployment() {
        let options = key_options().build();
        assert!(options.tls);
        assert!(options.echo_messages);
        assert!(options.queue_messages);
        assert_eq!(options.format, WireFormat::Json);
        assert_eq!(options.disconnected_retry_timeout, Duration::from_secs(15));
        assert_eq!(options.suspended_retry_timeout, Duration::from_secs(30));
        assert!(options.validate().is_ok());
    }

    #[rstest]
    fn wildcard_client_id_is_rejected() {
        let options = key_options().client_id("*").build();
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[rstest]
    #[case("abc-def:42", true)]
    #[case("abc_DEF-9:-7", true)]
    #[case("abc def:42", false)]
    #[case("abcdef", false)]
    #[case("abc:def:42", false)]
    fn recover_key_validation(#[case] key: &str, #[case] ok: bool) {
        let options = key_options().recover(key).build();
        assert_eq!(options.validate().is_ok(), ok);
    }
}
