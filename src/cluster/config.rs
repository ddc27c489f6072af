//! # Cluster Configuration
//!
//! The persistent descriptor of one cluster: id, name, codec methods, grow
//! factors, conflict strategy and availability status. A copy lives in the
//! storage's configuration root; the cluster itself works from that copy and
//! pushes attribute changes back through the storage.

use eyre::{bail, ensure, Result};

/// Extension of the data file holding record pages.
pub const DATA_FILE_EXTENSION: &str = ".pcl";

/// Extension of the position-map sidecar file.
pub const POSITION_MAP_EXTENSION: &str = ".cpm";

pub const DEFAULT_GROW_FACTOR: f32 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Online,
    Offline,
}

impl ClusterStatus {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(ClusterStatus::Online),
            "OFFLINE" => Ok(ClusterStatus::Offline),
            other => bail!("unknown cluster status '{}'", other),
        }
    }
}

/// Attributes changeable at runtime through `PaginatedCluster::set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAttribute {
    Name,
    RecordGrowFactor,
    RecordOverflowGrowFactor,
    ConflictStrategy,
    Status,
    Encryption,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub id: i32,
    pub name: String,
    pub record_grow_factor: f32,
    pub record_overflow_grow_factor: f32,
    pub compression: String,
    pub encryption: String,
    pub encryption_key: Option<String>,
    pub conflict_strategy: Option<String>,
    pub status: ClusterStatus,
}

impl ClusterConfig {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            record_grow_factor: DEFAULT_GROW_FACTOR,
            record_overflow_grow_factor: DEFAULT_GROW_FACTOR,
            compression: crate::compression::NOTHING_COMPRESSION.to_string(),
            encryption: crate::encryption::NOTHING_ENCRYPTION.to_string(),
            encryption_key: None,
            conflict_strategy: None,
            status: ClusterStatus::Online,
        }
    }

    pub fn data_file_name(&self) -> String {
        format!("{}{}", self.name, DATA_FILE_EXTENSION)
    }

    pub fn position_map_file_name(&self) -> String {
        format!("{}{}", self.name, POSITION_MAP_EXTENSION)
    }
}

/// Validates a cluster name for use as a file-name stem.
pub fn check_valid_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), "cluster name must not be empty");
    ensure!(
        !name.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|']),
        "cluster name '{}' contains characters invalid in file names",
        name
    );
    ensure!(
        !name.chars().any(char::is_control),
        "cluster name contains control characters"
    );
    ensure!(!name.starts_with('.'), "cluster name '{}' must not start with a dot", name);
    Ok(())
}

/// Parses a grow-factor attribute value.
pub fn parse_grow_factor(attribute: &str, value: &str) -> Result<f32> {
    let factor: f32 = value
        .trim()
        .parse()
        .map_err(|_| eyre::eyre!("invalid value for cluster attribute {}: '{}'", attribute, value))?;
    ensure!(factor >= 1.0, "{} cannot be less than 1", attribute);
    Ok(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_online_and_uncompressed() {
        let config = ClusterConfig::new(3, "users");

        assert_eq!(config.id, 3);
        assert_eq!(config.status, ClusterStatus::Online);
        assert_eq!(config.compression, "nothing");
        assert_eq!(config.encryption, "nothing");
        assert_eq!(config.data_file_name(), "users.pcl");
        assert_eq!(config.position_map_file_name(), "users.cpm");
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(ClusterStatus::parse("online").unwrap(), ClusterStatus::Online);
        assert_eq!(ClusterStatus::parse("OFFLINE").unwrap(), ClusterStatus::Offline);
        assert!(ClusterStatus::parse("frozen").is_err());
    }

    #[test]
    fn name_validation_rejects_path_tricks() {
        assert!(check_valid_name("users").is_ok());
        assert!(check_valid_name("users_2024").is_ok());
        assert!(check_valid_name("").is_err());
        assert!(check_valid_name("a/b").is_err());
        assert!(check_valid_name("..\\evil").is_err());
        assert!(check_valid_name(".hidden").is_err());
    }

    #[test]
    fn grow_factor_must_be_at_least_one() {
        assert_eq!(parse_grow_factor("RECORD_GROW_FACTOR", "1.5").unwrap(), 1.5);
        assert!(parse_grow_factor("RECORD_GROW_FACTOR", "0.5").is_err());
        assert!(parse_grow_factor("RECORD_GROW_FACTOR", "abc").is_err());
    }
}
