use std::borrow::Cow;

/// Normalize a bind host.
///
/// An empty host or the `":"` shorthand both mean "all interfaces".
pub fn normalize_bind_host(host: &str) -> Cow<'_, str> {
    let host = host.trim();
    if host.is_empty() || host == ":" {
        Cow::Borrowed("0.0.0.0")
    } else {
        Cow::Borrowed(host)
    }
}

/// Join a host and port into something `TcpListener::bind` / `TcpStream::connect` accept.
///
/// Bare IPv6 literals are bracketed; already-bracketed hosts pass through.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = normalize_bind_host(host);
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_host_shorthand_means_all_interfaces() {
        assert_eq!(normalize_bind_host("").as_ref(), "0.0.0.0");
        assert_eq!(normalize_bind_host(" : ").as_ref(), "0.0.0.0");
        assert_eq!(normalize_bind_host(" 127.0.0.1 ").as_ref(), "127.0.0.1");
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("127.0.0.1", 80), "127.0.0.1:80");
        assert_eq!(join_host_port("::1", 443), "[::1]:443");
        assert_eq!(join_host_port("[::]", 443), "[::]:443");
        assert_eq!(join_host_port("example.com", 22), "example.com:22");
        assert_eq!(join_host_port("", 8080), "0.0.0.0:8080");
    }
}
