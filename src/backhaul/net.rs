use std::{borrow::Cow, net::IpAddr};

/// Normalize a bind/listen address.
///
/// `":PORT"` is accepted as shorthand for all IPv4 interfaces and becomes
/// `"0.0.0.0:PORT"`; anything else is passed through trimmed. Listening on
/// IPv6 takes an explicit address such as `"[::]:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Join a host and port into a dialable address, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{join_host_port, normalize_bind_addr};

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":5000").as_ref(), "0.0.0.0:5000");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:5000").as_ref(),
            "127.0.0.1:5000"
        );
        assert_eq!(normalize_bind_addr("[::]:5000").as_ref(), "[::]:5000");
    }

    #[test]
    fn join_host_port_brackets_v6_only() {
        assert_eq!(join_host_port("127.0.0.1", 5000), "127.0.0.1:5000");
        assert_eq!(join_host_port("tunnel.example.com", 5000), "tunnel.example.com:5000");
        assert_eq!(join_host_port("::1", 5000), "[::1]:5000");
        assert_eq!(join_host_port("[::1]", 5000), "[::1]:5000");
    }
}
