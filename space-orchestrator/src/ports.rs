//! External port reservation for space ports.

use crate::error::{OrchestratorError, Result};
use crate::host::Host;
use crate::space::{PortLink, Space};
use crate::store::SpaceStore;
use rand::Rng;
use std::fmt;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 1024;

/// Inclusive range external ports are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn parse(range_str: &str) -> anyhow::Result<Self> {
        // Validate format: START-END
        let (start, end) = range_str.split_once('-').ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid port range format: {}. Expected START-END (e.g., 20000-29999)",
                range_str
            )
        })?;

        let start: u16 = start
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid start port: {}", start))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid end port: {}", end))?;

        Self::new(start, end)
    }

    pub fn new(start: u16, end: u16) -> anyhow::Result<Self> {
        if start > end {
            anyhow::bail!(
                "Invalid range: start ({}) must not be greater than end ({})",
                start,
                end
            );
        }
        Ok(PortRange { start, end })
    }

    pub fn size(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn sample(&self) -> u16 {
        rand::rng().random_range(self.start..=self.end)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 29999,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Reserves unique `(external address, external port)` pairs for spaces.
///
/// Collision detection is left to the store's unique index so that
/// concurrent provisioning tasks never need an in-process lock.
#[derive(Clone)]
pub struct PortAllocator {
    store: SpaceStore,
    range: PortRange,
    max_attempts: u32,
}

impl PortAllocator {
    pub fn new(store: SpaceStore, range: PortRange) -> Self {
        Self {
            store,
            range,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserve an external port on `host` for `space_port` and append the
    /// link to the space.
    pub async fn secure(&self, space: &mut Space, host: &Host, space_port: u16) -> Result<PortLink> {
        debug!(space = %space.id, space_port, "Securing port");

        for attempt in 1..=self.max_attempts {
            let candidate = self.range.sample();

            if self
                .store
                .is_port_taken(host.external_address(), candidate)
                .await?
            {
                debug!(space = %space.id, candidate, attempt, "Port is taken");
                continue;
            }

            match self
                .store
                .insert_port_link(
                    &space.id,
                    space_port,
                    candidate,
                    host.external_address(),
                    host.display_address(),
                )
                .await
            {
                Ok(link) => {
                    info!(
                        space = %space.id,
                        external_port = candidate,
                        space_port,
                        "Secured port mapping"
                    );
                    space.port_links.push(link.clone());
                    return Ok(link);
                }
                Err(OrchestratorError::PortConflict { .. }) => {
                    debug!(space = %space.id, candidate, attempt, "Lost race for port");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            space = %space.id,
            host = %host.name(),
            attempts = self.max_attempts,
            "No free port found"
        );
        Err(OrchestratorError::NoPortsAvailable {
            host: host.name().to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_range() {
        let range = PortRange::parse("20000-29999").unwrap();
        assert_eq!(range.start, 20000);
        assert_eq!(range.end, 29999);
        assert_eq!(range.size(), 10000);
        assert_eq!(range, PortRange::default());
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(PortRange::parse("20000").is_err());
        assert!(PortRange::parse("20000-29999-30000").is_err());
        assert!(PortRange::parse("invalid-range").is_err());
    }

    #[test]
    fn test_parse_invalid_range() {
        assert!(PortRange::parse("29999-20000").is_err());
        assert!(PortRange::parse("20000-20000").is_ok());
    }

    #[test]
    fn test_sample_stays_in_range() {
        let range = PortRange::new(20000, 20009).unwrap();
        for _ in 0..500 {
            assert!(range.contains(range.sample()));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(PortRange::default().to_string(), "20000-29999");
    }
}
