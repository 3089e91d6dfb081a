use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    net::{IpAddr, Ipv4Addr},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use ip_filter_common::{POLICY_ALLOW, POLICY_DENY};
use ipnet::Ipv4Net;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use ip_filter_common::parse::{ETH_HDR_LEN, ETH_P_IPV4, IPV4_MIN_HEADER_LEN};

pub const SYNTHETIC_FRAME_LEN: usize = ETH_HDR_LEN + IPV4_MIN_HEADER_LEN;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct PolicyEntry {
    pub network: Ipv4Net,
    pub policy: u8,
}

impl fmt::Display for PolicyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.network, self.policy)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid policy '{0}': expected allow, deny or a byte value")]
pub struct PolicyParseError(String);

/// `allow` and `deny` map to the agent's policy bytes; raw values 0-255 are
/// stored as given.
pub fn parse_policy(value: &str) -> Result<u8, PolicyParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "allow" | "pass" => Ok(POLICY_ALLOW),
        "deny" | "drop" => Ok(POLICY_DENY),
        other => other
            .parse::<u8>()
            .map_err(|_| PolicyParseError(value.to_string())),
    }
}

/// Parse a country zone list: one CIDR per line.
///
/// Lines that do not hold an IPv4 CIDR are skipped, matching how the
/// upstream lists are consumed; `label` only shows up in log output.
pub fn parse_zone<R: BufRead>(reader: R, label: &str) -> Result<Vec<Ipv4Net>> {
    let mut networks = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {} of {label}", line_no + 1))?;
        let trimmed = strip_comment(&line);
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<Ipv4Net>() {
            Ok(net) => networks.push(net.trunc()),
            Err(_) => warn!(
                zone = label,
                line = line_no + 1,
                entry = trimmed,
                "skipping entry that is not an IPv4 CIDR"
            ),
        }
    }

    Ok(networks)
}

/// Load a rules file: `CIDR [policy]` per line, policy defaulting to deny.
///
/// Unlike zone lists, every line must parse.
pub fn load_rules(path: &Path) -> Result<Vec<PolicyEntry>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open rules file at {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} of {}", line_no + 1, path.display())
        })?;
        let trimmed = strip_comment(&line);
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let cidr = parts.next().unwrap_or_default();
        let policy = match parts.next() {
            Some(raw) => parse_policy(raw)
                .with_context(|| format!("line {} of {}", line_no + 1, path.display()))?,
            None => POLICY_DENY,
        };
        if let Some(extra) = parts.next() {
            return Err(anyhow!(
                "unexpected '{extra}' on line {} of {}",
                line_no + 1,
                path.display()
            ));
        }
        let network = parse_network(cidr).with_context(|| {
            format!("invalid network '{cidr}' on line {} of {}", line_no + 1, path.display())
        })?;
        entries.push(PolicyEntry { network, policy });
    }

    Ok(entries)
}

/// Accepts `a.b.c.d/len` or a bare address (treated as `/32`).
pub fn parse_network(raw: &str) -> Result<Ipv4Net> {
    if raw.contains('/') {
        let net: Ipv4Net = raw.parse()?;
        return Ok(net.trunc());
    }
    match raw.parse::<IpAddr>()? {
        IpAddr::V4(addr) => Ok(Ipv4Net::from(addr)),
        IpAddr::V6(_) => Err(anyhow!("IPv6 addresses are not filtered")),
    }
}

/// Minimal Ethernet + IPv4 frame carrying `source`, for offline checks.
pub fn synthetic_frame(source: Ipv4Addr) -> [u8; SYNTHETIC_FRAME_LEN] {
    let mut frame = [0u8; SYNTHETIC_FRAME_LEN];
    frame[12..14].copy_from_slice(&ETH_P_IPV4.to_be_bytes());
    frame[14] = 0x45;
    frame[22] = 64;
    frame[26..30].copy_from_slice(&source.octets());
    frame
}

/// Decode a frame given as hex. Whitespace and `:` separators are ignored.
pub fn decode_hex_frame(raw: &str) -> Result<Vec<u8>> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && *c != ':')
        .collect();
    hex::decode(digits).context("invalid hex frame")
}

fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_zone_skips_comments_and_garbage() {
        let input = "\
# generated list
1.0.1.0/24
1.0.2.0/23   # trailing comment

2001:db8::/32
not-a-cidr
10.1.2.3/8
";
        let nets = parse_zone(input.as_bytes(), "test").unwrap();
        let expected: Vec<Ipv4Net> = ["1.0.1.0/24", "1.0.2.0/23", "10.0.0.0/8"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(nets, expected);
    }

    #[test]
    fn parse_policy_accepts_names_and_bytes() {
        assert_eq!(parse_policy("allow"), Ok(1));
        assert_eq!(parse_policy("DENY"), Ok(0));
        assert_eq!(parse_policy("drop"), Ok(0));
        assert_eq!(parse_policy("7"), Ok(7));
        assert!(parse_policy("256").is_err());
        assert!(parse_policy("maybe").is_err());
    }

    #[test]
    fn load_rules_defaults_to_deny() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.0/8").unwrap();
        writeln!(file, "10.1.0.0/16 allow # carve-out").unwrap();
        writeln!(file, "192.0.2.7 3").unwrap();
        let rules = load_rules(file.path()).unwrap();
        assert_eq!(
            rules,
            vec![
                PolicyEntry {
                    network: "10.0.0.0/8".parse().unwrap(),
                    policy: 0
                },
                PolicyEntry {
                    network: "10.1.0.0/16".parse().unwrap(),
                    policy: 1
                },
                PolicyEntry {
                    network: "192.0.2.7/32".parse().unwrap(),
                    policy: 3
                },
            ]
        );
    }

    #[test]
    fn load_rules_reports_line_numbers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.0/8").unwrap();
        writeln!(file, "10.0.0.0/33").unwrap();
        let err = load_rules(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn parse_network_truncates_host_bits() {
        assert_eq!(
            parse_network("10.1.2.3/8").unwrap(),
            "10.0.0.0/8".parse::<Ipv4Net>().unwrap()
        );
        assert!(parse_network("::1").is_err());
    }

    #[test]
    fn synthetic_frame_places_source_address() {
        let frame = synthetic_frame(Ipv4Addr::new(198, 51, 100, 4));
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(&frame[26..30], &[198, 51, 100, 4]);
    }

    #[test]
    fn decode_hex_frame_handles_separators() {
        assert_eq!(decode_hex_frame("08:00 45").unwrap(), vec![0x08, 0x00, 0x45]);
        assert_eq!(
            decode_hex_frame("FF ee\n0a").unwrap(),
            vec![0xff, 0xee, 0x0a]
        );
        assert!(decode_hex_frame("abc").is_err());
        assert!(decode_hex_frame("zz").is_err());
        assert!(decode_hex_frame("").unwrap().is_empty());
    }
}
