//! Port-mapping syntax: `host:container[,host:container...]`.
//!
//! Both sides are decimal. The container side is `1..=65535`; the host side
//! may also be `0`, meaning the backend picks an ephemeral port.

use std::fmt;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    /// `0` for an ephemeral host port.
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    pub fn new(host: u16, container: u16) -> Self {
        Self { host, container }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.host == 0
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// Parse a port map. An empty string is an empty map.
pub fn parse_ports(spec: &str, max: usize) -> CoreResult<Vec<PortMapping>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<&str> = spec.split(',').collect();
    if entries.len() > max {
        return Err(CoreError::TooManyPorts {
            count: entries.len(),
            max,
        });
    }

    entries
        .into_iter()
        .map(|entry| {
            let entry = entry.trim();
            let (host, container) = entry
                .split_once(':')
                .ok_or_else(|| CoreError::InvalidPortFormat(format!("{entry:?}: expected host:container")))?;
            let host = parse_port(host, entry)?;
            let container = parse_port(container, entry)?;
            if container == 0 {
                return Err(CoreError::InvalidPortFormat(format!(
                    "{entry:?}: container port must be 1-65535"
                )));
            }
            Ok(PortMapping { host, container })
        })
        .collect()
}

fn parse_port(raw: &str, entry: &str) -> CoreResult<u16> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::InvalidPortFormat(format!("{entry:?}: ports must be decimal")));
    }
    raw.parse::<u16>()
        .map_err(|_| CoreError::InvalidPortFormat(format!("{entry:?}: port out of range")))
}

/// Canonical textual form, the inverse of [`parse_ports`].
pub fn format_ports(ports: &[PortMapping]) -> String {
    ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Rewrite every host side to ephemeral (`0:container`).
pub fn to_ephemeral(ports: &[PortMapping]) -> Vec<PortMapping> {
    ports
        .iter()
        .map(|p| PortMapping::new(0, p.container))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn parse_simple_map() {
        let ports = parse_ports("8080:80,0:443", 10).unwrap();
        assert_eq!(ports, vec![PortMapping::new(8080, 80), PortMapping::new(0, 443)]);
        assert!(ports[1].is_ephemeral());
    }

    #[test]
    fn empty_map_is_allowed() {
        assert!(parse_ports("", 10).unwrap().is_empty());
    }

    #[test]
    fn malformed_entries_rejected() {
        for bad in ["80", "a:80", "80:", ":80", "80:0", "70000:80", "80:-1", "80:80:80", "+80:80"] {
            let err = parse_ports(bad, 10).unwrap_err();
            assert!(matches!(err, CoreError::InvalidPortFormat(_)), "{bad} -> {err:?}");
        }
    }

    #[test]
    fn too_many_ports_rejected() {
        let spec = (1..=11).map(|p| format!("0:{p}")).collect::<Vec<_>>().join(",");
        let err = parse_ports(&spec, 10).unwrap_err();
        assert!(matches!(err, CoreError::TooManyPorts { count: 11, max: 10 }));
    }

    #[test]
    fn ephemeral_rewrite_keeps_container_side() {
        let ports = parse_ports("8080:80,9090:90", 10).unwrap();
        assert_eq!(format_ports(&to_ephemeral(&ports)), "0:80,0:90");
    }

    #[test]
    fn format_then_parse_round_trips() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let len = rng.gen_range(0..=10);
            let ports: Vec<PortMapping> = (0..len)
                .map(|_| PortMapping::new(rng.gen_range(0..=65535), rng.gen_range(1..=65535)))
                .collect();
            assert_eq!(parse_ports(&format_ports(&ports), 10).unwrap(), ports);
        }
    }
}
