//! Common test fixtures.

use sol_sync::command::{Command, GameCommand, PlayerId};
use sol_sync::math::{Fixed, Vec2Fixed};
use sol_sync::store::CreateMatchOptions;

/// Create a fixed-point number from an integer.
#[must_use]
pub fn fixed(n: i32) -> Fixed {
    Fixed::from_num(n)
}

/// Create a fixed-point number from a float.
#[must_use]
pub fn fixed_f(n: f64) -> Fixed {
    Fixed::from_num(n)
}

/// Player id shorthand.
#[must_use]
pub fn pid(id: &str) -> PlayerId {
    PlayerId::from(id)
}

/// Roster of `count` players named `player-0`, `player-1`, ...
#[must_use]
pub fn roster(count: usize) -> Vec<PlayerId> {
    (0..count).map(|i| PlayerId::new(format!("player-{i}"))).collect()
}

/// Match options with a fixed seed.
#[must_use]
pub fn match_options(seed: u64, max_players: usize) -> CreateMatchOptions {
    CreateMatchOptions {
        max_players,
        seed: Some(seed),
        ..CreateMatchOptions::default()
    }
}

/// Move order for `units` to whole-number coordinates.
#[must_use]
pub fn move_to(units: &[u32], x: i32, y: i32) -> Command {
    Command::MoveUnits {
        unit_ids: units.to_vec(),
        target: Vec2Fixed::from_ints(x, y),
    }
}

/// Stamped move order from `player` at `tick`.
#[must_use]
pub fn move_units(tick: u64, player: &str, units: &[u32], x: i32, y: i32) -> GameCommand {
    GameCommand::new(tick, pid(player), move_to(units, x, y))
}
