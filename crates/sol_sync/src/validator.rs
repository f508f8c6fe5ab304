//! Command validation.
//!
//! The validator is a pure predicate over a command and a fixed set of
//! rules. It never looks at the current tick or queue contents, so the
//! sending peer and every receiving peer reach the same verdict for the same
//! command.

use std::collections::BTreeSet;

use crate::command::{Command, GameCommand, PlayerId, STATE_HASH_COMMAND};
use crate::config::SyncConfig;
use crate::error::ValidationError;
use crate::math::{Fixed, Vec2Fixed};

/// Static limits a command is checked against.
#[derive(Debug, Clone)]
pub struct ValidationRules {
    /// Players allowed to author commands. `None` accepts any non-empty id.
    pub roster: Option<BTreeSet<PlayerId>>,
    /// Positions must lie within `[-extent, extent]` on both axes.
    pub map_half_extent: Fixed,
    /// Largest unit selection.
    pub max_units: usize,
    /// Largest production batch.
    pub max_batch: u32,
    /// Highest tick a command may target.
    pub max_tick: u64,
    /// Longest player or ability id.
    pub max_identifier_len: usize,
}

impl ValidationRules {
    /// Build rules from the sync config and the match's map size.
    #[must_use]
    pub fn from_config(config: &SyncConfig, map_half_extent: i32) -> Self {
        Self {
            roster: None,
            map_half_extent: Fixed::from_num(map_half_extent),
            max_units: config.max_units_per_command,
            max_batch: config.max_batch_size,
            max_tick: config.max_tick,
            max_identifier_len: config.max_identifier_len,
        }
    }

    /// Restrict authors to a fixed roster.
    #[must_use]
    pub fn with_roster<I>(mut self, roster: I) -> Self
    where
        I: IntoIterator<Item = PlayerId>,
    {
        self.roster = Some(roster.into_iter().collect());
        self
    }
}

/// Gate for gameplay commands on both the sending and receiving side.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    rules: ValidationRules,
}

impl CommandValidator {
    /// Create a validator.
    #[must_use]
    pub const fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }

    /// The rules in force.
    #[must_use]
    pub const fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Predicate form of [`validate`](Self::validate).
    #[must_use]
    pub fn is_valid(&self, command: &GameCommand) -> bool {
        self.validate(command).is_ok()
    }

    /// Check a gameplay command.
    pub fn validate(&self, command: &GameCommand) -> Result<(), ValidationError> {
        self.check_author(command.player_id())?;

        if command.tick() > self.rules.max_tick {
            return Err(ValidationError::TickOutOfRange {
                tick: command.tick(),
                max: self.rules.max_tick,
            });
        }

        match command.command() {
            Command::MoveUnits { unit_ids, target } => {
                self.check_units(unit_ids)?;
                self.check_position(*target)
            }
            Command::Attack {
                unit_ids,
                target_id,
            } => {
                self.check_units(unit_ids)?;
                if unit_ids.contains(target_id) {
                    return Err(ValidationError::SelfTarget(*target_id));
                }
                Ok(())
            }
            Command::CastAbility {
                ability, target, ..
            } => {
                self.check_ability(ability)?;
                match target {
                    Some(pos) => self.check_position(*pos),
                    None => Ok(()),
                }
            }
            Command::BuildStructure { position, .. } => self.check_position(*position),
            Command::ProduceUnit { count, .. } => {
                if *count == 0 || *count > self.rules.max_batch {
                    return Err(ValidationError::BadBatchSize {
                        count: *count,
                        max: self.rules.max_batch,
                    });
                }
                Ok(())
            }
            Command::Noop => Ok(()),
            Command::StateHash { .. } => {
                Err(ValidationError::ReservedCommandType(STATE_HASH_COMMAND))
            }
        }
    }

    fn check_author(&self, player: &PlayerId) -> Result<(), ValidationError> {
        let len = player.as_str().len();
        if len == 0 {
            return Err(ValidationError::EmptyPlayerId);
        }
        if len > self.rules.max_identifier_len {
            return Err(ValidationError::PlayerIdTooLong {
                len,
                max: self.rules.max_identifier_len,
            });
        }
        if let Some(roster) = &self.rules.roster {
            if !roster.contains(player) {
                return Err(ValidationError::UnknownPlayer(player.clone()));
            }
        }
        Ok(())
    }

    fn check_units(&self, unit_ids: &[u32]) -> Result<(), ValidationError> {
        if unit_ids.is_empty() {
            return Err(ValidationError::NoUnits);
        }
        if unit_ids.len() > self.rules.max_units {
            return Err(ValidationError::TooManyUnits {
                count: unit_ids.len(),
                max: self.rules.max_units,
            });
        }
        let mut seen = BTreeSet::new();
        for &id in unit_ids {
            if !seen.insert(id) {
                return Err(ValidationError::DuplicateUnit(id));
            }
        }
        Ok(())
    }

    fn check_position(&self, pos: Vec2Fixed) -> Result<(), ValidationError> {
        if pos.within_extent(self.rules.map_half_extent) {
            Ok(())
        } else {
            Err(ValidationError::OutOfBounds {
                x: pos.x.to_string(),
                y: pos.y.to_string(),
            })
        }
    }

    fn check_ability(&self, ability: &str) -> Result<(), ValidationError> {
        let well_formed = !ability.is_empty()
            && ability.len() <= self.rules.max_identifier_len
            && ability
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if well_formed {
            Ok(())
        } else {
            Err(ValidationError::BadAbilityId(ability.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::UnitKind;
    use crate::wire;

    fn validator() -> CommandValidator {
        let rules = ValidationRules::from_config(&SyncConfig::default(), 1000)
            .with_roster([PlayerId::from("alice"), PlayerId::from("bob")]);
        CommandValidator::new(rules)
    }

    fn cmd(player: &str, command: Command) -> GameCommand {
        GameCommand::new(0, PlayerId::from(player), command)
    }

    fn move_to(x: i32, y: i32) -> Command {
        Command::MoveUnits {
            unit_ids: vec![1, 2],
            target: Vec2Fixed::from_ints(x, y),
        }
    }

    #[test]
    fn test_accepts_valid_commands() {
        let v = validator();
        assert!(v.is_valid(&cmd("alice", move_to(10, 10))));
        assert!(v.is_valid(&cmd("bob", move_to(-10, -10))));
        assert!(v.is_valid(&cmd("bob", Command::Noop)));
        assert!(v.is_valid(&cmd(
            "alice",
            Command::CastAbility {
                unit_id: 4,
                ability: "solar_flare".into(),
                target: None,
            }
        )));
        assert!(v.is_valid(&cmd(
            "alice",
            Command::ProduceUnit {
                unit: UnitKind::Fighter,
                count: 10,
            }
        )));
    }

    #[test]
    fn test_rejects_author_problems() {
        let v = validator();
        assert_eq!(
            v.validate(&cmd("", Command::Noop)),
            Err(ValidationError::EmptyPlayerId)
        );
        assert_eq!(
            v.validate(&cmd("mallory", Command::Noop)),
            Err(ValidationError::UnknownPlayer(PlayerId::from("mallory")))
        );
        let long = "x".repeat(65);
        assert!(matches!(
            v.validate(&cmd(&long, Command::Noop)),
            Err(ValidationError::PlayerIdTooLong { len: 65, .. })
        ));
    }

    #[test]
    fn test_rejects_payload_shapes() {
        let v = validator();
        assert!(matches!(
            v.validate(&cmd("alice", move_to(1001, 0))),
            Err(ValidationError::OutOfBounds { .. })
        ));
        assert_eq!(
            v.validate(&cmd(
                "alice",
                Command::MoveUnits {
                    unit_ids: vec![],
                    target: Vec2Fixed::ZERO
                }
            )),
            Err(ValidationError::NoUnits)
        );
        assert_eq!(
            v.validate(&cmd(
                "alice",
                Command::MoveUnits {
                    unit_ids: vec![3, 3],
                    target: Vec2Fixed::ZERO
                }
            )),
            Err(ValidationError::DuplicateUnit(3))
        );
        assert_eq!(
            v.validate(&cmd(
                "alice",
                Command::Attack {
                    unit_ids: vec![1, 2],
                    target_id: 2
                }
            )),
            Err(ValidationError::SelfTarget(2))
        );
        assert!(matches!(
            v.validate(&cmd(
                "alice",
                Command::ProduceUnit {
                    unit: UnitKind::Drone,
                    count: 0
                }
            )),
            Err(ValidationError::BadBatchSize { .. })
        ));
        assert!(matches!(
            v.validate(&cmd(
                "alice",
                Command::CastAbility {
                    unit_id: 1,
                    ability: "Drop Table".into(),
                    target: None
                }
            )),
            Err(ValidationError::BadAbilityId(_))
        ));
    }

    #[test]
    fn test_rejects_too_many_units() {
        let v = validator();
        let unit_ids: Vec<u32> = (0..65).collect();
        assert!(matches!(
            v.validate(&cmd(
                "alice",
                Command::MoveUnits {
                    unit_ids,
                    target: Vec2Fixed::ZERO
                }
            )),
            Err(ValidationError::TooManyUnits { count: 65, max: 64 })
        ));
    }

    #[test]
    fn test_rejects_tick_beyond_limit() {
        let v = validator();
        let late = GameCommand::new(v.rules().max_tick + 1, PlayerId::from("alice"), Command::Noop);
        assert!(matches!(
            v.validate(&late),
            Err(ValidationError::TickOutOfRange { .. })
        ));
    }

    #[test]
    fn test_state_hash_is_reserved_on_gameplay_path() {
        let v = validator();
        assert_eq!(
            v.validate(&cmd("alice", Command::StateHash { hash: 5 })),
            Err(ValidationError::ReservedCommandType(STATE_HASH_COMMAND))
        );
    }

    #[test]
    fn test_verdict_is_identical_after_transmission() {
        let v = validator();
        let samples = [
            cmd("alice", move_to(10, 10)),
            cmd("alice", move_to(5000, 10)),
            cmd("mallory", Command::Noop),
            cmd(
                "bob",
                Command::Attack {
                    unit_ids: vec![9],
                    target_id: 9,
                },
            ),
        ];
        for sample in samples {
            let received = wire::decode(&wire::encode(&sample).unwrap()).unwrap();
            assert_eq!(v.validate(&sample), v.validate(&received));
            // Checking twice never changes the verdict
            assert_eq!(v.validate(&sample), v.validate(&sample));
        }
    }

    #[test]
    fn test_without_roster_accepts_any_author() {
        let v = CommandValidator::new(ValidationRules::from_config(&SyncConfig::default(), 10));
        assert!(v.is_valid(&cmd("anyone", Command::Noop)));
    }
}
