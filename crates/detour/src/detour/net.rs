use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio bind APIs do not accept `":PORT"`, so we normalize it to
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Splits an optional `scheme://` prefix off an endpoint string.
///
/// `"tcp://0.0.0.0:3811"` yields `("tcp", "0.0.0.0:3811")`; a bare address
/// yields the provided default scheme.
pub fn split_scheme<'a>(endpoint: &'a str, default_scheme: &'a str) -> (&'a str, &'a str) {
    let endpoint = endpoint.trim();
    match endpoint.split_once("://") {
        Some((scheme, rest)) => (scheme, rest.trim_end_matches('/')),
        None => (default_scheme, endpoint),
    }
}

/// Splits a comma separated endpoint list, dropping blanks.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn split_scheme_with_and_without_prefix() {
        assert_eq!(split_scheme("tcp://0.0.0.0:3811", "tcp"), ("tcp", "0.0.0.0:3811"));
        assert_eq!(split_scheme(" 10.0.0.1:3811 ", "tcp"), ("tcp", "10.0.0.1:3811"));
        assert_eq!(split_scheme("tcp://h:1/", "x"), ("tcp", "h:1"));
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(
            split_list("a:1, b:2,,  "),
            vec!["a:1".to_string(), "b:2".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
