//! Allow-list of downstream clients and the redirect URIs they may use.

use std::collections::{HashMap, HashSet};
use url::{Host, Url};

/// Registered downstream clients, keyed by `client_id`.
///
/// An empty registry denies every client.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, String>,
    redirect_uris: HashSet<String>,
}

impl ClientRegistry {
    /// Build the registry from `id` or `id=Display Name` entries.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let clients = entries
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                let (id, name) = match entry.split_once('=') {
                    Some((id, name)) => (id.trim(), name.trim()),
                    None => (entry, entry),
                };
                if id.is_empty() {
                    return None;
                }
                let name = if name.is_empty() { id } else { name };
                Some((id.to_string(), name.to_string()))
            })
            .collect();

        Self {
            clients,
            redirect_uris: HashSet::new(),
        }
    }

    /// Accept these redirect URIs verbatim in addition to loopback ones.
    pub fn with_redirect_uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.redirect_uris = uris
            .into_iter()
            .filter_map(|uri| Url::parse(uri.as_ref().trim()).ok())
            .map(String::from)
            .collect();
        self
    }

    /// Native clients receive codes on a loopback listener (RFC 8252 7.3)
    /// on any port. Anything else must be registered exactly.
    pub fn redirect_allowed(&self, redirect_uri: &Url) -> bool {
        if redirect_uri.fragment().is_some() {
            return false;
        }
        if redirect_uri.scheme() == "http" && is_loopback(redirect_uri) {
            return true;
        }
        self.redirect_uris.contains(redirect_uri.as_str())
    }

    pub fn is_allowed(&self, client_id: &str) -> bool {
        !client_id.is_empty() && self.clients.contains_key(client_id)
    }

    /// Name shown on the approval page.
    pub fn display_name<'a>(&'a self, client_id: &'a str) -> &'a str {
        self.clients
            .get(client_id)
            .map(String::as_str)
            .unwrap_or(client_id)
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}
