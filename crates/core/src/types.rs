use serde::{Deserialize, Serialize};

/// Outcome side of a binary up/down market.
///
/// Token index 0 of a market is the UP outcome, index 1 is DOWN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Up,
    Down,
}

impl Direction {
    /// Position of this outcome's token in the market descriptor.
    #[must_use]
    pub const fn token_index(self) -> usize {
        match self {
            Self::Up => 0,
            Self::Down => 1,
        }
    }

    /// Conditional-token index set used for redemption (1 for UP, 2 for DOWN).
    #[must_use]
    pub const fn index_set(self) -> u32 {
        1 << self.token_index()
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }

    #[must_use]
    pub const fn from_token_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}
