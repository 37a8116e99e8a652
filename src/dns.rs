//! DNS lookups for input construction and the `dns.a` / `dns.ptr` policy
//! helpers. All lookups go through one process-wide resolver built from the
//! system configuration; a host with no resolver configuration degrades to
//! empty results rather than failing the auth path.

use std::net::IpAddr;
use std::sync::LazyLock;

use hickory_resolver::TokioAsyncResolver;

static RESOLVER: LazyLock<Option<TokioAsyncResolver>> = LazyLock::new(|| {
    match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => Some(resolver),
        Err(error) => {
            tracing::warn!(%error, "Unable to build DNS resolver from system configuration; lookups will return errors");
            None
        }
    }
});

/// `dns.a`: forward-resolve a name to its addresses.
pub async fn lookup_a(name: &str) -> Result<Vec<String>, String> {
    let resolver = RESOLVER
        .as_ref()
        .ok_or_else(|| "dns.a: error: no resolver configured".to_string())?;
    let lookup = resolver
        .lookup_ip(name)
        .await
        .map_err(|e| format!("dns.a: error: {e}"))?;
    Ok(lookup.iter().map(|ip| ip.to_string()).collect())
}

/// `dns.ptr`: reverse-resolve an address to its names. The empty string and
/// `"@"` resolve to the empty list; anything else must parse as an IP.
pub async fn lookup_ptr(ip: &str) -> Result<Vec<String>, String> {
    if ip.is_empty() || ip == "@" {
        return Ok(Vec::new());
    }
    let addr: IpAddr = ip
        .parse()
        .map_err(|e| format!("dns.ptr: invalid argument (IP address required): {e}"))?;
    let resolver = RESOLVER
        .as_ref()
        .ok_or_else(|| "dns.ptr: error: no resolver configured".to_string())?;
    let lookup = resolver
        .reverse_lookup(addr)
        .await
        .map_err(|e| format!("dns.ptr: error: {e}"))?;
    Ok(lookup.iter().map(|name| name.to_string()).collect())
}

/// Forward-confirmed reverse DNS: reverse-resolve the IP, then keep only
/// names whose forward resolution includes the original IP. Lookup failures
/// (including hosts with no PTR record) resolve to the empty set; an
/// unresolvable peer must not fail the auth path.
pub async fn forward_confirmed_names(ip: &str) -> Vec<String> {
    if ip.is_empty() {
        return Vec::new();
    }
    let names = match lookup_ptr(ip).await {
        Ok(names) => names,
        Err(error) => {
            tracing::debug!(ip, error, "Reverse DNS lookup failed");
            return Vec::new();
        }
    };

    let mut confirmed = Vec::new();
    for name in names {
        match lookup_a(&name).await {
            Ok(addrs) if addrs.iter().any(|a| a == ip) => confirmed.push(name),
            Ok(_) => tracing::debug!(ip, name, "Discarding reverse name that does not resolve back"),
            Err(error) => tracing::debug!(ip, name, error, "Forward confirmation lookup failed"),
        }
    }
    confirmed
}
