//! Address-based connection authentication.
//!
//! At accept time the server evaluates the requested subvolume's
//! `{allow, reject}` option lists against the peer's address. Entries are
//! either subdir-qualified clauses `<path>(<addr>|<addr>)` or bare address
//! patterns applied to the default subdir `/`. A reject match wins over any
//! allow match; with no match either way the graph's own defaults decide.
//! Peers on non-privileged ports are rejected outright unless insecure
//! access is enabled; unix-domain peers bypass the port check.

use log::{info, warn};

use crate::options::Options;
use crate::transport::AddrFamily;
use crate::transport::name::PRIVILEGED_PORT_CEILING;

/// Outcome of evaluating the option lists for one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthResult {
    /// An allow pattern matched.
    Accept,
    /// A reject pattern matched, or the peer's port is not acceptable.
    Reject,
    /// Neither list matched; the caller's defaults decide.
    DontCare,
}

/// The peer and mount being evaluated.
#[derive(Clone, Debug)]
pub struct PeerInput<'a> {
    /// Subvolume the peer asked for.
    pub subvolume: &'a str,
    /// Peer identifier: `host:port` for inet families, path for unix.
    pub identifier: &'a str,
    /// Peer address family.
    pub family: AddrFamily,
    /// Subdirectory being mounted; `/` when unspecified.
    pub subdir: &'a str,
}

/// Glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    // iterative wildcard matcher with single backtrack point
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

fn looks_like_host_name(s: &str) -> bool {
    !s.is_empty()
        && !s.contains(['*', '?'])
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'))
}

/// Walk one address list; on a hit, record `status` into `result` and stop.
/// Returns true when something matched.
fn compare_addr_and_update(
    list: &str,
    delimiter: char,
    peer_addr: &str,
    subvol: &str,
    result: &mut AuthResult,
    status: AuthResult,
) -> bool {
    for raw in list.split(delimiter) {
        let mut pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }
        info!(
            "{subvol}: {} = \"{pattern}\", received addr = \"{peer_addr}\"",
            if status == AuthResult::Accept { "allowed" } else { "rejected" },
        );
        let negate = pattern.starts_with('!');
        if negate {
            pattern = &pattern[1..];
        }

        let matched = if !pattern.starts_with('*') && looks_like_host_name(pattern) {
            pattern == peer_addr
        } else {
            glob_match(pattern, peer_addr)
        };
        if matched != negate {
            *result = status;
            return true;
        }
    }
    false
}

/// Evaluate one option value (allow or reject list) for `subdir`.
fn parse_entries_and_compare(
    option: &str,
    peer_addr: &str,
    subvol: &str,
    subdir: &str,
    result: &mut AuthResult,
    status: AuthResult,
) {
    if !option.starts_with('/') && !option.contains('(') {
        // bare address list, applies to the default subdir
        compare_addr_and_update(option, ',', peer_addr, subvol, result, status);
        return;
    }

    for entry in option.split(',') {
        let entry = entry.trim();
        let Some((directory, rest)) = entry.split_once('(') else {
            continue;
        };
        let directory = directory.trim();
        if !directory.starts_with('/') {
            warn!("{subvol}: malformed auth entry \"{entry}\"");
            return;
        }
        if directory != subdir {
            continue;
        }
        let Some(addrs) = rest.strip_suffix(')') else {
            warn!("{subvol}: malformed auth entry \"{entry}\"");
            return;
        };
        info!("{subvol}: found an entry for dir {subdir} ({addrs}), performing validation");
        if compare_addr_and_update(addrs, '|', peer_addr, subvol, result, status) {
            return;
        }
    }
}

/// Evaluate the peer against the configured allow/reject lists.
pub fn authenticate(input: &PeerInput<'_>, config: &Options) -> AuthResult {
    let mut result = AuthResult::DontCare;
    let name = input.subvolume;

    let allow_key = format!("auth.addr.{name}.allow");
    let legacy_allow_key = format!("auth.ip.{name}.allow");
    let reject_key = format!("auth.addr.{name}.reject");

    let allow = config
        .get(&allow_key)
        .or_else(|| config.get(&legacy_allow_key));
    let reject = config.get(&reject_key);

    if allow.is_none() && reject.is_none() {
        return AuthResult::DontCare;
    }

    let peer_addr: &str;
    match input.family {
        AddrFamily::Inet | AddrFamily::Inet6 | AddrFamily::InetSdp => {
            let Some((addr, service)) = input.identifier.rsplit_once(':') else {
                warn!("{name}: malformed peer identifier \"{}\"", input.identifier);
                return result;
            };
            peer_addr = addr;

            let allow_insecure = config.get_bool("rpc-auth-allow-insecure").unwrap_or(false);
            let peer_port: u16 = match service.parse() {
                Ok(port) => port,
                Err(_) => {
                    warn!("{name}: malformed peer port \"{service}\"");
                    return result;
                }
            };
            if peer_port >= PRIVILEGED_PORT_CEILING && !allow_insecure {
                warn!("{name}: client is bound to port {peer_port} which is not privileged");
                return AuthResult::Reject;
            }
        }
        AddrFamily::Unix => {
            peer_addr = input.identifier;
        }
    }

    if let Some(reject) = reject {
        parse_entries_and_compare(
            reject,
            peer_addr,
            name,
            input.subdir,
            &mut result,
            AuthResult::Reject,
        );
        if result == AuthResult::Reject {
            return result;
        }
    }

    if let Some(allow) = allow {
        parse_entries_and_compare(
            allow,
            peer_addr,
            name,
            input.subdir,
            &mut result,
            AuthResult::Accept,
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer<'a>(identifier: &'a str) -> PeerInput<'a> {
        PeerInput {
            subvolume: "vol0",
            identifier,
            family: AddrFamily::Inet,
            subdir: "/",
        }
    }

    fn config(pairs: &[(&str, &str)]) -> Options {
        pairs.iter().copied().collect()
    }

    #[test]
    fn reject_takes_precedence() {
        let config = config(&[
            ("auth.addr.vol0.allow", "*"),
            ("auth.addr.vol0.reject", "10.0.0.5"),
        ]);
        assert_eq!(authenticate(&peer("10.0.0.5:1001"), &config), AuthResult::Reject);
        assert_eq!(authenticate(&peer("10.0.0.6:1001"), &config), AuthResult::Accept);
    }

    #[test]
    fn dotted_quad_globs() {
        let config = config(&[("auth.addr.vol0.allow", "192.168.*, 10.1.10.*")]);
        assert_eq!(authenticate(&peer("192.168.4.7:999"), &config), AuthResult::Accept);
        assert_eq!(authenticate(&peer("10.1.10.3:999"), &config), AuthResult::Accept);
        assert_eq!(authenticate(&peer("10.2.10.3:999"), &config), AuthResult::DontCare);
    }

    #[test]
    fn negated_pattern() {
        let config = config(&[("auth.addr.vol0.allow", "!10.10.1*")]);
        // anything not matching the negated glob is accepted
        assert_eq!(authenticate(&peer("10.10.11.1:999"), &config), AuthResult::DontCare);
        assert_eq!(authenticate(&peer("172.16.0.1:999"), &config), AuthResult::Accept);
    }

    #[test]
    fn unprivileged_port_rejected_unless_insecure() {
        let config_strict = config(&[("auth.addr.vol0.allow", "*")]);
        assert_eq!(
            authenticate(&peer("10.0.0.7:49152"), &config_strict),
            AuthResult::Reject
        );

        let config_insecure = config(&[
            ("auth.addr.vol0.allow", "*"),
            ("rpc-auth-allow-insecure", "on"),
        ]);
        assert_eq!(
            authenticate(&peer("10.0.0.7:49152"), &config_insecure),
            AuthResult::Accept
        );
    }

    #[test]
    fn unix_peers_bypass_port_check() {
        let config = config(&[("auth.addr.vol0.allow", "*")]);
        let input = PeerInput {
            subvolume: "vol0",
            identifier: "/run/stackfs.sock",
            family: AddrFamily::Unix,
            subdir: "/",
        };
        assert_eq!(authenticate(&input, &config), AuthResult::Accept);
    }

    #[test]
    fn subdir_clauses() {
        let config = config(&[(
            "auth.addr.vol0.allow",
            "/data(192.168.1.*|10.0.0.1),/scratch(*)",
        )]);

        let mut input = peer("192.168.1.9:900");
        input.subdir = "/data";
        assert_eq!(authenticate(&input, &config), AuthResult::Accept);

        input.subdir = "/scratch";
        assert_eq!(authenticate(&input, &config), AuthResult::Accept);

        input.subdir = "/other";
        assert_eq!(authenticate(&input, &config), AuthResult::DontCare);

        let mut stranger = peer("172.16.0.9:900");
        stranger.subdir = "/data";
        assert_eq!(authenticate(&stranger, &config), AuthResult::DontCare);
    }

    #[test]
    fn legacy_ip_alias() {
        let config = config(&[("auth.ip.vol0.allow", "127.0.0.1")]);
        assert_eq!(authenticate(&peer("127.0.0.1:600"), &config), AuthResult::Accept);
    }

    #[test]
    fn no_lists_means_dont_care() {
        let config = Options::new();
        assert_eq!(authenticate(&peer("127.0.0.1:600"), &config), AuthResult::DontCare);
    }

    #[test]
    fn glob_matcher() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("192.168.*", "192.168.0.1"));
        assert!(!glob_match("192.168.*", "192.169.0.1"));
        assert!(glob_match("10.?.1.1", "10.9.1.1"));
        assert!(!glob_match("10.?.1.1", "10.99.1.1"));
    }
}
