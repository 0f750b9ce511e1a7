use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumIter;

/// Axis positions keyed by axis, in millimetres.
pub type AxisMap = BTreeMap<Axis, f64>;

/// Gantry axis identifiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Serialize, Deserialize,
)]
pub enum Axis {
    /// Gantry left/right
    X,
    /// Gantry front/back
    Y,
    /// Left mount height
    Z,
    /// Right mount height
    A,
    /// Left plunger
    B,
    /// Right plunger
    C,
}

impl Axis {
    /// Single-letter name used on the wire.
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::A => 'A',
            Axis::B => 'B',
            Axis::C => 'C',
        }
    }

    /// Mount height axes.
    pub fn is_mount_z(&self) -> bool {
        matches!(self, Axis::Z | Axis::A)
    }

    /// Plunger axes.
    pub fn is_plunger(&self) -> bool {
        matches!(self, Axis::B | Axis::C)
    }

    /// Shared gantry axes.
    pub fn is_gantry(&self) -> bool {
        matches!(self, Axis::X | Axis::Y)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Y" => Ok(Axis::Y),
            "Z" => Ok(Axis::Z),
            "A" => Ok(Axis::A),
            "B" => Ok(Axis::B),
            "C" => Ok(Axis::C),
            other => Err(format!("invalid axis '{other}': expected one of X, Y, Z, A, B, C")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_parse_roundtrip() {
        for axis in Axis::iter() {
            assert_eq!(axis.to_string().parse::<Axis>().unwrap(), axis);
        }
        assert_eq!("z".parse::<Axis>().unwrap(), Axis::Z);
        assert!("Q".parse::<Axis>().is_err());
    }

    #[test]
    fn test_axis_groups() {
        assert!(Axis::Z.is_mount_z() && Axis::A.is_mount_z());
        assert!(Axis::B.is_plunger() && Axis::C.is_plunger());
        assert!(Axis::X.is_gantry() && !Axis::B.is_gantry());
    }
}
