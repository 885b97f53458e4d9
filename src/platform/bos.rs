//! Policy for devices already running this firmware natively.
//!
//! Used when the board identifier is unrecognized or reports a native
//! release; the stock tooling is all present, so the defaults apply.

use super::PlatformPolicy;

pub struct BosNative {
    board: String,
}

impl BosNative {
    pub fn new(board: &str) -> Self {
        Self {
            board: board.to_string(),
        }
    }
}

impl PlatformPolicy for BosNative {
    fn name(&self) -> &str {
        &self.board
    }
}
