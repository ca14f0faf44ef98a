//! Connection-string parsing.
//!
//! Accepted forms, first match wins:
//!
//! - `3301` — port only, host defaults to `localhost`
//! - `host:3301`
//! - `user@host:3301` / `user:pass@host:3301`
//! - `[::1]:3301`, optionally with a `user[:pass]@` prefix
//! - `unix/:/path/to/socket` or `/:/path/to/socket`
//! - `host:/path/to/socket` (anything before `:/` is ignored)
//! - `env/:VAR` — parse the value of the environment variable `VAR`
//!
//! Malformed or empty input parses to the empty value rather than an error:
//! the connection reports `invalid_parameter` when asked to open with it.

/// Parsed connection-string parts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnStringParts {
    pub unix_path: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
}

impl ConnStringParts {
    pub fn is_empty(&self) -> bool {
        self.unix_path.is_empty() && self.host.is_empty() && self.port.is_empty()
    }

    /// Render back to a canonical connection string accepted by [`parse`].
    pub fn render(&self) -> String {
        if !self.unix_path.is_empty() {
            return format!("unix/:{}", self.unix_path);
        }
        if self.host.is_empty() && self.port.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        if !self.user.is_empty() {
            out.push_str(&self.user);
            if !self.password.is_empty() {
                out.push(':');
                out.push_str(&self.password);
            }
            out.push('@');
        }
        if self.host.contains(':') {
            out.push('[');
            out.push_str(&self.host);
            out.push(']');
        } else {
            out.push_str(&self.host);
        }
        out.push(':');
        out.push_str(&self.port);
        out
    }
}

/// Lexical port check: 1..=5 decimal digits, nonzero, fits in u16.
fn valid_port(chunk: &str) -> bool {
    if chunk.is_empty() || chunk.len() > 5 || !chunk.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(chunk.parse::<u32>(), Ok(1..=65535))
}

/// Split `tail` at the first occurrence of any byte in `sep`; returns the
/// prefix and leaves the separator at the front of `tail`.
fn chunk<'a>(tail: &mut &'a str, sep: &[char]) -> &'a str {
    match tail.find(|c| sep.contains(&c)) {
        Some(pos) => {
            let head = &tail[..pos];
            *tail = &tail[pos..];
            head
        }
        None => std::mem::take(tail),
    }
}

/// Parse a connection string. Malformed input yields the empty parts value.
pub fn parse(connection_string: &str) -> ConnStringParts {
    parse_inner(connection_string, 0)
}

fn parse_inner(connection_string: &str, depth: u8) -> ConnStringParts {
    if connection_string.is_empty() || depth > 8 {
        return ConnStringParts::default();
    }
    let mut res = ConnStringParts::default();
    let mut tail = connection_string;
    let mut first = true;

    while res.port.is_empty() {
        let head = chunk(&mut tail, &[':', '/', '@', '[']);
        if tail.is_empty() {
            // the whole string must have been a bare port
            if !first || !valid_port(head) {
                return ConnStringParts::default();
            }
            res.port = head.to_owned();
            break;
        }

        match tail.as_bytes()[0] {
            b':' => {
                tail = &tail[1..];
                if tail.starts_with('/') {
                    // host:/path — a unix socket target
                    res.unix_path = tail.to_owned();
                    return res;
                }
                let second = chunk(&mut tail, &[':', '/', '@', '[']);
                if tail.is_empty() {
                    if !valid_port(second) {
                        return ConnStringParts::default();
                    }
                    res.host = head.to_owned();
                    res.port = second.to_owned();
                } else if tail.starts_with('@') {
                    res.user = head.to_owned();
                    res.password = second.to_owned();
                    tail = &tail[1..];
                } else {
                    return ConnStringParts::default();
                }
            }
            b'/' => {
                if tail.len() > 1 && tail.as_bytes()[1] == b':' {
                    tail = &tail[2..];
                    if head == "env" {
                        return match std::env::var(tail) {
                            Ok(value) => parse_inner(&value, depth + 1),
                            Err(_) => ConnStringParts::default(),
                        };
                    }
                    if !head.is_empty() && head != "unix" {
                        return ConnStringParts::default();
                    }
                }
                if !res.user.is_empty() {
                    return ConnStringParts::default();
                }
                res.unix_path = tail.to_owned();
                return res;
            }
            b'[' => {
                if !head.is_empty() {
                    return ConnStringParts::default();
                }
                tail = &tail[1..];
                let literal = chunk(&mut tail, &[']']);
                if literal.is_empty() || !tail.starts_with(']') {
                    return ConnStringParts::default();
                }
                tail = &tail[1..];
                let Some(port) = tail.strip_prefix(':') else {
                    return ConnStringParts::default();
                };
                if !valid_port(port) {
                    return ConnStringParts::default();
                }
                res.host = literal.to_owned();
                res.port = port.to_owned();
                tail = "";
            }
            // '@' with no password
            _ => {
                res.user = head.to_owned();
                tail = &tail[1..];
            }
        }
        first = false;
    }

    if res.unix_path.is_empty() {
        if res.user.is_empty() {
            res.user = "guest".to_owned();
        }
        if res.host.is_empty() {
            res.host = "localhost".to_owned();
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(
        unix_path: &str,
        user: &str,
        password: &str,
        host: &str,
        port: &str,
    ) -> ConnStringParts {
        ConnStringParts {
            unix_path: unix_path.into(),
            user: user.into(),
            password: password.into(),
            host: host.into(),
            port: port.into(),
        }
    }

    #[test]
    fn port_only() {
        assert_eq!(parse("3301"), parts("", "guest", "", "localhost", "3301"));
    }

    #[test]
    fn port_bounds() {
        assert!(!parse("1").is_empty());
        assert!(!parse("65535").is_empty());
        assert!(parse("0").is_empty());
        assert!(parse("65536").is_empty());
        assert!(parse("abc").is_empty());
        assert!(parse("123456").is_empty());
    }

    #[test]
    fn host_and_port() {
        assert_eq!(
            parse("tnt.example.com:3301"),
            parts("", "guest", "", "tnt.example.com", "3301")
        );
        assert!(parse("host:badport").is_empty());
    }

    #[test]
    fn user_password_host_port() {
        assert_eq!(
            parse("alice:secret@db:3302"),
            parts("", "alice", "secret", "db", "3302")
        );
        assert_eq!(parse("bob@db:3302"), parts("", "bob", "", "db", "3302"));
    }

    #[test]
    fn ipv6_literal() {
        assert_eq!(parse("[::1]:3301"), parts("", "guest", "", "::1", "3301"));
        assert_eq!(
            parse("alice:pw@[fe80::1]:3301"),
            parts("", "alice", "pw", "fe80::1", "3301")
        );
        assert!(parse("[::1]3301").is_empty());
        assert!(parse("[]:3301").is_empty());
    }

    #[test]
    fn unix_socket_forms() {
        assert_eq!(
            parse("unix/:/var/run/tnt.sock"),
            parts("/var/run/tnt.sock", "", "", "", "")
        );
        assert_eq!(
            parse("/:/var/run/tnt.sock"),
            parts("/var/run/tnt.sock", "", "", "", "")
        );
        assert_eq!(
            parse("localhost:/tmp/tnt.sock"),
            parts("/tmp/tnt.sock", "", "", "", "")
        );
        // no user@ allowed in front of a unix path
        assert!(parse("alice@unix/:/tmp/tnt.sock").is_empty());
        assert!(parse("foo/:/tmp/tnt.sock").is_empty());
    }

    #[test]
    fn env_indirection() {
        std::env::set_var("TARANTOOL_EVIO_TEST_CS", "cart:pw@db:3303");
        assert_eq!(
            parse("env/:TARANTOOL_EVIO_TEST_CS"),
            parts("", "cart", "pw", "db", "3303")
        );
        assert!(parse("env/:TARANTOOL_EVIO_NO_SUCH_VAR").is_empty());
    }

    #[test]
    fn empty_and_garbage() {
        assert!(parse("").is_empty());
        assert!(parse("host:").is_empty());
        assert!(parse("a:b:c").is_empty());
    }

    #[test]
    fn render_roundtrip() {
        for cs in [
            "3301",
            "db:3301",
            "alice@db:3301",
            "alice:pw@db:3301",
            "[::1]:3301",
            "alice:pw@[::1]:3301",
            "unix/:/tmp/tnt.sock",
        ] {
            let first = parse(cs);
            assert!(!first.is_empty(), "{cs}");
            assert_eq!(parse(&first.render()), first, "{cs}");
        }
    }
}
