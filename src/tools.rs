//! Various helper and utility functions commonly used in the gateway.

use crate::channels::Channel;

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use anyhow::bail;
use reqwest::{Client, ClientBuilder, redirect};

/// Process-wide pooled client for requests that use no proxy (the metrics
/// backend, channels without one configured).
static SHARED_CLIENT: LazyLock<Client> =
    LazyLock::new(|| build_client(None).expect("default client"));

/// Pooled clients keyed by proxy URL. reqwest fixes the proxy at build time,
/// so each distinct proxy gets one client, built lazily and reused.
static PROXY_CLIENTS: LazyLock<Mutex<HashMap<String, Client>>> = LazyLock::new(Default::default);

fn build_client(proxy: Option<&str>) -> anyhow::Result<Client> {
    let mut builder = ClientBuilder::new()
        .redirect(redirect::Policy::none())
        .pool_max_idle_per_host(20);

    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    Ok(builder.build()?)
}

/// The shared no-proxy client.
#[must_use]
pub fn shared_client() -> Client {
    SHARED_CLIENT.clone()
}

/// Resolve the outbound proxy for one channel: the channel-local proxy when
/// the channel opts in, else the global one when globally enabled.
#[must_use]
pub fn effective_proxy<'a>(
    channel: &'a Channel,
    global_proxy: Option<&'a str>,
    global_proxy_enabled: bool,
) -> Option<&'a str> {
    if channel.proxy_enabled {
        return channel.proxy.as_deref();
    }
    if global_proxy_enabled {
        return global_proxy;
    }
    None
}

/// Pooled client for a channel, honoring its proxy selection.
///
/// # Errors
/// Will return `Err` when the proxy URL does not parse (`http://`,
/// `https://` and `socks5://` schemes are supported), or the client cache
/// lock was poisoned.
pub fn client_for(
    channel: &Channel,
    global_proxy: Option<&str>,
    global_proxy_enabled: bool,
) -> anyhow::Result<Client> {
    let Some(proxy) = effective_proxy(channel, global_proxy, global_proxy_enabled) else {
        return Ok(shared_client());
    };

    let mut clients = match PROXY_CLIENTS.lock() {
        Ok(c) => c,
        Err(e) => bail!("failed locking proxy client cache: {e}"),
    };
    if let Some(client) = clients.get(proxy) {
        return Ok(client.clone());
    }
    let client = build_client(Some(proxy))?;
    clients.insert(proxy.to_string(), client.clone());
    Ok(client)
}

/// Shorter to_string() alias
pub trait ToStringExt: ToString {
    #[allow(missing_docs)]
    fn s(&self) -> String {
        self.to_string()
    }
}

impl<T> ToStringExt for T where T: ToString {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelKind;

    fn channel(proxy: Option<&str>, proxy_enabled: bool) -> Channel {
        Channel {
            kind: ChannelKind::Webhook { url: "http://x".s() },
            enabled: true,
            template: "t".s(),
            image_enabled: false,
            send_resolved: true,
            proxy: proxy.map(ToString::to_string),
            proxy_enabled,
            timeout_seconds: 10,
        }
    }

    #[test]
    fn channel_proxy_wins_when_opted_in() {
        let channel = channel(Some("socks5://127.0.0.1:1080"), true);
        assert_eq!(
            effective_proxy(&channel, Some("http://global:3128"), true),
            Some("socks5://127.0.0.1:1080")
        );
    }

    #[test]
    fn global_proxy_applies_when_channel_has_none() {
        let channel = channel(None, false);
        assert_eq!(
            effective_proxy(&channel, Some("http://global:3128"), true),
            Some("http://global:3128")
        );
        assert_eq!(
            effective_proxy(&channel, Some("http://global:3128"), false),
            None
        );
    }

    #[test]
    fn proxied_clients_are_cached_per_proxy() {
        let channel = channel(Some("http://127.0.0.1:3128"), true);
        client_for(&channel, None, false).unwrap();
        client_for(&channel, None, false).unwrap();
        assert!(!PROXY_CLIENTS.lock().unwrap().is_empty());
    }

    #[test]
    fn no_proxy_uses_the_shared_client() {
        let channel = channel(None, false);
        client_for(&channel, None, false).unwrap();
    }
}
