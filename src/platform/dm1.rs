//! Policy for the DM1 family (DragonMint G9/G19).
//!
//! These boards ship with everything the partition operations need; plain
//! NAND backup and restore, no preparation step, no factory images.

use super::PlatformPolicy;

pub struct Dm1 {
    board: String,
}

impl Dm1 {
    pub fn new(board: &str) -> Self {
        Self {
            board: board.to_string(),
        }
    }
}

impl PlatformPolicy for Dm1 {
    fn name(&self) -> &str {
        &self.board
    }
}
