//! Host selection for transport opens.
//!
//! The primary host is derived from the configured environment or host
//! override; the fallback pool is a fixed set of labelled hostnames under
//! the public domain. Fallbacks are only eligible for retries within the
//! default configuration: a custom host or named environment pins every
//! attempt to the primary unless an explicit pool is supplied.

use rand::seq::SliceRandom;

use crate::options::ClientOptions;

const DEFAULT_DOMAIN: &str = "livewire.dev";

const DEFAULT_FALLBACKS: [&str; 5] = [
    "realtime-a.livewire.dev",
    "realtime-b.livewire.dev",
    "realtime-c.livewire.dev",
    "realtime-d.livewire.dev",
    "realtime-e.livewire.dev",
];

/// Host routing state for one connection.
pub(crate) struct Endpoint {
    primary: String,
    port: u16,
    tls: bool,
    pool: Vec<String>,
    shuffled: bool,
    cursor: usize,
}

impl Endpoint {
    pub(crate) fn from_options(options: &ClientOptions) -> Self {
        let primary = match (&options.realtime_host, &options.environment) {
            (Some(host), _) => host.clone(),
            (None, Some(env)) => format!("{env}-realtime.{DEFAULT_DOMAIN}"),
            (None, None) => format!("realtime.{DEFAULT_DOMAIN}"),
        };
        // A custom host or environment opts out of the default pool; an
        // explicit pool overrides that.
        let pool = match &options.fallback_hosts {
            Some(hosts) => hosts.clone(),
            None if options.realtime_host.is_some() || options.environment.is_some() => Vec::new(),
            None => DEFAULT_FALLBACKS.iter().map(|h| (*h).to_string()).collect(),
        };
        let port = options.port.unwrap_or(if options.tls { 443 } else { 80 });
        Self {
            primary,
            port,
            tls: options.tls,
            pool,
            shuffled: false,
            cursor: 0,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn tls(&self) -> bool {
        self.tls
    }

    pub(crate) fn primary(&self) -> &str {
        &self.primary
    }

    /// Pick the host for the next open attempt.
    ///
    /// The pool is shuffled once per reconnect series and then cycled, so
    /// the order is stable within a series; `reset` starts a fresh series.
    pub(crate) fn host_for_attempt(&mut self, use_fallback: bool) -> String {
        if !use_fallback || self.pool.is_empty() {
            return self.primary.clone();
        }
        if !self.shuffled {
            self.pool.shuffle(&mut rand::thread_rng());
            self.shuffled = true;
        }
        let host = self.pool[self.cursor % self.pool.len()].clone();
        self.cursor += 1;
        host
    }

    /// Forget the current shuffle; called on a successful connection.
    pub(crate) fn reset(&mut self) {
        self.shuffled = false;
        self.cursor = 0;
    }
}
