use serde::{Deserialize, Serialize};
use tracing::warn;

/// Number of distinct tile kinds. Tiles arrive pre-normalized to `[0, 33]`.
pub const TILE_KINDS: u8 = 34;

/// Size of the flat action space:
/// 34 discard + 34 pon + 34 kon + 34 hu + 1 pass.
pub const NUM_ACTIONS: usize = 137;

/// Flat index of the pass action.
pub const PASS_INDEX: usize = 136;

/// Operation kinds the engine can encode. Wire values match the game server's
/// operate codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operate {
    Pass = 1,
    Pon = 4,
    Kon = 8,
    Hu = 32,
    Discard = 64,
}

impl Operate {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Operate::Pass),
            4 => Some(Operate::Pon),
            8 => Some(Operate::Kon),
            32 => Some(Operate::Hu),
            64 => Some(Operate::Discard),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// An action descriptor as it crosses the wire: raw operate code plus tile
/// index. Raw codes are kept so that candidates the codec does not understand
/// can still be returned verbatim from the random branch of the decision
/// procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub operate: u8,
    pub tile: u8,
}

impl Action {
    /// The canonical pass action: operate 1, tile 0.
    pub fn pass() -> Self {
        Action {
            operate: Operate::Pass.code(),
            tile: 0,
        }
    }

    /// Canonicalize: a pass is tile-less, so its tile is forced to 0.
    pub fn normalized(self) -> Self {
        if self.operate == Operate::Pass.code() && self.tile != 0 {
            warn!(tile = self.tile, "normalizing pass action: tile -> 0");
            return Action::pass();
        }
        self
    }

    /// Flat index of this action, if it is encodable.
    pub fn index(&self) -> Option<usize> {
        let operate = Operate::from_code(self.operate)?;
        encode(operate, self.tile)
    }
}

/// Map an (operate, tile) pair to its flat action index. Returns `None` for
/// operate kinds outside the encodable set and for out-of-range tiles.
pub fn encode(operate: Operate, tile: u8) -> Option<usize> {
    if operate != Operate::Pass && tile >= TILE_KINDS {
        return None;
    }
    let tile = tile as usize;
    match operate {
        Operate::Discard => Some(tile),
        Operate::Pon => Some(34 + tile),
        Operate::Kon => Some(68 + tile),
        Operate::Hu => Some(102 + tile),
        Operate::Pass => Some(PASS_INDEX),
    }
}

/// Inverse of [`encode`]. Pass decodes to tile 0.
pub fn decode(index: usize) -> Option<(Operate, u8)> {
    match index {
        0..=33 => Some((Operate::Discard, index as u8)),
        34..=67 => Some((Operate::Pon, (index - 34) as u8)),
        68..=101 => Some((Operate::Kon, (index - 68) as u8)),
        102..=135 => Some((Operate::Hu, (index - 102) as u8)),
        PASS_INDEX => Some((Operate::Pass, 0)),
        _ => None,
    }
}
