use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Configs use the shorthand `":PORT"` for "all interfaces", which Tokio's bind
/// APIs reject; it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// `host:port`, bracketing IPv6 literals. An empty host means all interfaces.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.is_empty() {
        return format!("0.0.0.0:{port}");
    }
    if host.contains(':') && !host.starts_with('[') {
        return format!("[{host}]:{port}");
    }
    format!("{host}:{port}")
}

/// Port part of a `host:port` / `:port` address.
pub fn port_of(addr: &str) -> Option<u16> {
    addr.trim().rsplit_once(':')?.1.parse().ok()
}
