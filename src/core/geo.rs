use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TileError;

/// Represents a tile coordinate in the slippy map tile system
///
/// The canonical string form `"z/x/y"` is the externally visible tile id used by
/// [`TileQueue`](crate::tiles::TileQueue) lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Canonical tile id, `"z/x/y"`
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.z, self.x, self.y)
    }

    /// Checks if the tile lies inside the grid of its zoom level
    pub fn is_valid(&self) -> bool {
        // 2^z overflows u32 past zoom 31, where every u32 coordinate is in range
        match 1_u32.checked_shl(self.z as u32) {
            Some(max_coord) => self.x < max_coord && self.y < max_coord,
            None => true,
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

impl FromStr for TileCoord {
    type Err = TileError;

    /// Parses the canonical `"z/x/y"` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TileError::InvalidCoordinates(s.to_string());

        let mut parts = s.split('/');
        let (Some(z), Some(x), Some(y), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(TileCoord {
            z: z.trim().parse().map_err(|_| invalid())?,
            x: x.trim().parse().map_err(|_| invalid())?,
            y: y.trim().parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_coord_key_is_zxy() {
        let coord = TileCoord::new(3, 5, 4);
        assert_eq!(coord.key(), "4/3/5");
        assert_eq!(coord.to_string(), "4/3/5");
    }

    #[test]
    fn test_tile_coord_parse() {
        let coord: TileCoord = "12/654/1583".parse().unwrap();
        assert_eq!(coord, TileCoord::new(654, 1583, 12));

        assert!("12/654".parse::<TileCoord>().is_err());
        assert!("12/654/1583/1".parse::<TileCoord>().is_err());
        assert!("a/b/c".parse::<TileCoord>().is_err());
        assert!("300/0/0".parse::<TileCoord>().is_err());
    }

    #[test]
    fn test_tile_coord_validity() {
        assert!(TileCoord::new(0, 0, 0).is_valid());
        assert!(!TileCoord::new(1, 0, 0).is_valid());
        assert!(TileCoord::new(3, 3, 2).is_valid());
        assert!(!TileCoord::new(4, 3, 2).is_valid());
        assert!(TileCoord::new(u32::MAX, u32::MAX, 40).is_valid());
    }
}
