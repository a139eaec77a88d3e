//! System-resolver reader (spec.md §4.9/C12).
//!
//! Grounded on `original_source/resolvconf/__init__.py`'s
//! `get_system_resolvers` — same file, same line-matching approach, same
//! localhost/127.0.0.1 exclusion.

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Reads nameserver lines from `/etc/resolv.conf`, dropping `localhost` and
/// `127.0.0.1` entries (avoids forwarding to ourselves when this host also
/// runs a local stub resolver).
pub fn system_resolvers() -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(RESOLV_CONF) else {
        return Vec::new();
    };
    parse_resolv_conf(&contents)
}

fn parse_resolv_conf(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter(|line| line.contains("nameserver"))
        .filter_map(|line| line.split(' ').nth(1))
        .map(str::trim)
        .filter(|addr| *addr != "localhost" && *addr != "127.0.0.1")
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nameserver_lines() {
        let contents = "nameserver 8.8.8.8\nnameserver 1.1.1.1\nsearch example.com\n";
        assert_eq!(parse_resolv_conf(contents), vec!["8.8.8.8", "1.1.1.1"]);
    }

    #[test]
    fn drops_localhost_and_loopback() {
        let contents = "nameserver localhost\nnameserver 127.0.0.1\nnameserver 9.9.9.9\n";
        assert_eq!(parse_resolv_conf(contents), vec!["9.9.9.9"]);
    }
}
