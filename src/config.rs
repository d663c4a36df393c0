//! Simulation box and decomposition configuration.
//!
//! Configuration is plain data deserializable from TOML, with defaults
//! for the fields a single-rank run does not need to spell out. The
//! engine validates the node grid against the communicator size at
//! construction; everything checkable without a communicator is checked
//! by [`SystemConfig::validate`].

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_node_grid() -> [usize; 3] {
    [1, 1, 1]
}

/// Geometry of the simulation box and its decomposition.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Periodic box edge lengths.
    pub box_l: [f64; 3],
    /// Ranks per axis; the product must equal the communicator size.
    #[serde(default = "default_node_grid")]
    pub node_grid: [usize; 3],
    /// Real cells per axis on each rank.
    pub cell_grid: [usize; 3],
}

impl SystemConfig {
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let config: SystemConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for i in 0..3 {
            if !(self.box_l[i] > 0.0) {
                return Err(Error::Invalid(format!(
                    "box length along axis {} must be positive, got {}",
                    i, self.box_l[i]
                )));
            }
            if self.node_grid[i] == 0 {
                return Err(Error::Invalid(format!(
                    "node grid along axis {} must be at least 1",
                    i
                )));
            }
            if self.cell_grid[i] == 0 {
                return Err(Error::Invalid(format!(
                    "cell grid along axis {} must be at least 1",
                    i
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let config = SystemConfig::from_toml(
            r#"
            box_l = [10.0, 10.0, 10.0]
            cell_grid = [3, 3, 3]
            "#,
        )
        .unwrap();
        assert_eq!(config.node_grid, [1, 1, 1]);
        assert_eq!(config.cell_grid, [3, 3, 3]);
    }

    #[test]
    fn parses_explicit_node_grid() {
        let config = SystemConfig::from_toml(
            r#"
            box_l = [8.0, 4.0, 4.0]
            node_grid = [2, 1, 1]
            cell_grid = [2, 2, 2]
            "#,
        )
        .unwrap();
        assert_eq!(config.node_grid, [2, 1, 1]);
    }

    #[test]
    fn rejects_degenerate_geometry() {
        assert!(SystemConfig::from_toml(
            r#"
            box_l = [0.0, 10.0, 10.0]
            cell_grid = [3, 3, 3]
            "#,
        )
        .is_err());
        assert!(SystemConfig::from_toml(
            r#"
            box_l = [10.0, 10.0, 10.0]
            cell_grid = [0, 3, 3]
            "#,
        )
        .is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            SystemConfig::from_toml("box_l = ["),
            Err(Error::Parse(_))
        ));
    }
}
