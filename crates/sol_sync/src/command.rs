//! Player commands and identifiers.
//!
//! A [`GameCommand`] is one player-issued instruction stamped with the tick
//! it targets and its author. The instruction itself is a [`Command`], a
//! tagged union keyed by `commandType` so each type carries its own payload
//! schema.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::math::Vec2Fixed;

/// Wire name of the state-hash side channel. Never valid as gameplay input.
pub const STATE_HASH_COMMAND: &str = "__state_hash__";

/// Identifier of a player within a match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Wrap a player id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a match in the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(String);

impl MatchId {
    /// Wrap a match id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MatchId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Structures a player can place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    /// Reflects sunlight towards the forge.
    SolarMirror,
    /// Static defence.
    Turret,
    /// Extends the light network.
    Relay,
}

/// Units a forge can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Cheap, fast scout.
    Drone,
    /// Line combat unit.
    Fighter,
    /// Heavy capital ship.
    Frigate,
}

/// The instruction carried by a [`GameCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "commandType", content = "payload", rename_all = "snake_case")]
pub enum Command {
    /// Move a group of units to a position.
    #[serde(rename_all = "camelCase")]
    MoveUnits {
        /// Units to move.
        unit_ids: Vec<u32>,
        /// Destination.
        target: Vec2Fixed,
    },
    /// Order a group of units to attack an entity.
    #[serde(rename_all = "camelCase")]
    Attack {
        /// Attacking units.
        unit_ids: Vec<u32>,
        /// Entity under attack.
        target_id: u32,
    },
    /// Cast a unit ability, optionally at a position.
    #[serde(rename_all = "camelCase")]
    CastAbility {
        /// Caster.
        unit_id: u32,
        /// Ability identifier, lowercase ascii with underscores.
        ability: String,
        /// Optional ground target.
        #[serde(default)]
        target: Option<Vec2Fixed>,
    },
    /// Place a structure.
    #[serde(rename_all = "camelCase")]
    BuildStructure {
        /// What to build.
        structure: StructureKind,
        /// Where to build it.
        position: Vec2Fixed,
    },
    /// Queue unit production at the forge.
    #[serde(rename_all = "camelCase")]
    ProduceUnit {
        /// Unit type.
        unit: UnitKind,
        /// Batch size.
        count: u32,
    },
    /// Closes a player's input for a tick. Sent once per player per tick,
    /// after any real commands for that tick.
    Noop,
    /// State-hash side channel, intercepted before the command queue.
    #[serde(rename = "__state_hash__")]
    StateHash {
        /// Hash of the author's simulation state at the command tick.
        hash: u64,
    },
}

impl Command {
    /// Wire name of this command's type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::MoveUnits { .. } => "move_units",
            Self::Attack { .. } => "attack",
            Self::CastAbility { .. } => "cast_ability",
            Self::BuildStructure { .. } => "build_structure",
            Self::ProduceUnit { .. } => "produce_unit",
            Self::Noop => "noop",
            Self::StateHash { .. } => STATE_HASH_COMMAND,
        }
    }

    /// True for the end-of-tick marker.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::Noop)
    }

    /// True for side-channel traffic that must never reach the queue.
    #[must_use]
    pub const fn is_state_hash(&self) -> bool {
        matches!(self, Self::StateHash { .. })
    }
}

/// A tick-stamped command from one player. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameCommand {
    tick: u64,
    player_id: PlayerId,
    #[serde(flatten)]
    command: Command,
}

impl GameCommand {
    /// Create a command.
    #[must_use]
    pub fn new(tick: u64, player_id: PlayerId, command: Command) -> Self {
        Self {
            tick,
            player_id,
            command,
        }
    }

    /// Tick this command targets.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Author.
    #[must_use]
    pub const fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    /// The instruction.
    #[must_use]
    pub const fn command(&self) -> &Command {
        &self.command
    }

    /// Wire name of the instruction type.
    #[must_use]
    pub const fn command_type(&self) -> &'static str {
        self.command.type_name()
    }
}

/// Every command resolved for one tick, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickCommands {
    /// The resolved tick.
    pub tick: u64,
    /// Commands to apply, grouped by player in sorted id order, FIFO within a player.
    pub commands: Vec<GameCommand>,
}

impl TickCommands {
    /// True when every player only closed the tick without real input.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_match_wire_tags() {
        let commands = [
            Command::MoveUnits {
                unit_ids: vec![1],
                target: Vec2Fixed::ZERO,
            },
            Command::Noop,
            Command::StateHash { hash: 1 },
            Command::ProduceUnit {
                unit: UnitKind::Drone,
                count: 1,
            },
        ];
        for command in commands {
            let json = serde_json::to_value(&command).unwrap();
            assert_eq!(json["commandType"], command.type_name());
        }
    }

    #[test]
    fn test_state_hash_uses_reserved_name() {
        assert_eq!(
            Command::StateHash { hash: 0 }.type_name(),
            STATE_HASH_COMMAND
        );
        assert!(Command::StateHash { hash: 0 }.is_state_hash());
        assert!(!Command::Noop.is_state_hash());
    }

    #[test]
    fn test_player_id_display() {
        assert_eq!(PlayerId::from("alice").to_string(), "alice");
        assert_eq!(MatchId::new("m-1").as_str(), "m-1");
    }
}
