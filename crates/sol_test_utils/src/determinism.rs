//! Determinism testing utilities.
//!
//! Provides a harness for verifying that a simulation produces identical
//! results given identical inputs.
//!
//! # Testing Strategy
//!
//! Lockstep only works if every peer's simulation is a pure function of the
//! match seed and the resolved tick commands. Sources of non-determinism
//! include:
//!
//! - **Floating-point math**: positions use [`sol_sync::math::Fixed`].
//! - **HashMap iteration order**: always iterate `BTreeMap`s or sorted ids.
//! - **System randomness**: all randomness comes from the match
//!   [`SeededRng`], threaded explicitly.
//! - **Unstable hashing**: state hashes use [`sol_sync::hash::StateHasher`],
//!   never `DefaultHasher`.

use sol_sync::command::{PlayerId, TickCommands};
use sol_sync::rng::SeededRng;
use sol_sync::store::GameSettings;

use crate::arena::Arena;

/// Result of a determinism test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// Whether all runs produced identical results.
    pub is_deterministic: bool,
    /// Final hash from each run.
    pub hashes: Vec<u64>,
    /// Number of ticks simulated.
    pub ticks: u64,
}

impl DeterminismResult {
    /// Get all unique hashes (should be 1 for a deterministic simulation).
    #[must_use]
    pub fn unique_hashes(&self) -> Vec<u64> {
        let mut unique: Vec<u64> = self.hashes.clone();
        unique.sort_unstable();
        unique.dedup();
        unique
    }

    /// Assert that the simulation was deterministic, with a detailed error message.
    ///
    /// # Panics
    ///
    /// Panics if the simulation produced different hashes across runs.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic {
            let unique = self.unique_hashes();
            panic!(
                "Simulation is non-deterministic!\n\
                 Runs: {}\n\
                 Ticks: {}\n\
                 Unique hashes: {} (expected 1)\n\
                 All hashes: {:?}",
                self.hashes.len(),
                self.ticks,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run a simulation multiple times and verify determinism.
///
/// `step` receives the tick number so scripted input can depend on it.
///
/// # Example
///
/// ```ignore
/// let result = verify_determinism(
///     3,
///     10_000,
///     || Arena::new(SeededRng::new(12345), roster(), &GameSettings::default()),
///     |arena, tick| arena.step(&scripted(tick)),
///     Arena::state_hash,
/// );
/// result.assert_deterministic();
/// ```
pub fn verify_determinism<S, Setup, Step, HashFn>(
    runs: usize,
    ticks: u64,
    setup: Setup,
    step: Step,
    hash: HashFn,
) -> DeterminismResult
where
    Setup: Fn() -> S,
    Step: Fn(&mut S, u64),
    HashFn: Fn(&S) -> u64,
{
    let mut hashes = Vec::with_capacity(runs);

    for _ in 0..runs {
        let mut state = setup();
        for tick in 0..ticks {
            step(&mut state, tick);
        }
        hashes.push(hash(&state));
    }

    let is_deterministic = hashes.windows(2).all(|w| w[0] == w[1]);

    DeterminismResult {
        is_deterministic,
        hashes,
        ticks,
    }
}

/// Step two independently built simulations side by side.
///
/// Returns `None` if they agree on every tick, `Some(tick)` for the first
/// tick after which their hashes differ. Tick 0 means the initial states
/// already disagree.
pub fn find_first_divergence<S, Setup, Step, HashFn>(
    setup: Setup,
    step: Step,
    hash: HashFn,
    ticks: u64,
) -> Option<u64>
where
    Setup: Fn(usize) -> S,
    Step: Fn(&mut S, usize, u64),
    HashFn: Fn(&S) -> u64,
{
    let mut first = setup(0);
    let mut second = setup(1);

    if hash(&first) != hash(&second) {
        return Some(0);
    }

    for tick in 0..ticks {
        step(&mut first, 0, tick);
        step(&mut second, 1, tick);
        if hash(&first) != hash(&second) {
            return Some(tick + 1);
        }
    }

    None
}

/// Replay a tick stream on a fresh arena and collect the hash after every tick.
#[must_use]
pub fn replay_hashes(
    seed: u64,
    roster: &[PlayerId],
    settings: &GameSettings,
    ticks: impl IntoIterator<Item = TickCommands>,
) -> Vec<u64> {
    let mut arena = Arena::new(SeededRng::new(seed), roster.iter().cloned(), settings);
    ticks
        .into_iter()
        .map(|tick| {
            arena.step(&tick);
            arena.state_hash()
        })
        .collect()
}

/// Proptest strategies for commands and positions.
pub mod strategies {
    use proptest::prelude::*;
    use sol_sync::command::{Command, GameCommand, PlayerId, StructureKind, UnitKind};
    use sol_sync::math::{Fixed, Vec2Fixed};

    /// Whole-number position within `[-extent, extent]` on both axes.
    pub fn arb_position(extent: i32) -> impl Strategy<Value = Vec2Fixed> {
        (-extent..=extent, -extent..=extent).prop_map(|(x, y)| Vec2Fixed::from_ints(x, y))
    }

    /// Fixed-point number with a fractional part, for positions.
    pub fn arb_fixed(extent: i32) -> impl Strategy<Value = Fixed> {
        (-extent..extent, 0u32..1000).prop_map(|(whole, frac)| {
            Fixed::from_num(whole) + Fixed::from_num(frac) / Fixed::from_num(1000)
        })
    }

    /// Unit selection of 1..=8 distinct ids.
    pub fn arb_unit_ids() -> impl Strategy<Value = Vec<u32>> {
        proptest::collection::btree_set(1u32..500, 1..=8)
            .prop_map(|ids| ids.into_iter().collect())
    }

    /// Any gameplay command that passes default validation on a map of `extent`.
    pub fn arb_valid_command(extent: i32) -> impl Strategy<Value = Command> {
        prop_oneof![
            (arb_unit_ids(), arb_position(extent))
                .prop_map(|(unit_ids, target)| Command::MoveUnits { unit_ids, target }),
            (arb_unit_ids(), 500u32..1000).prop_map(|(unit_ids, target_id)| Command::Attack {
                unit_ids,
                target_id
            }),
            (1u32..500, prop::option::of(arb_position(extent))).prop_map(|(unit_id, target)| {
                Command::CastAbility {
                    unit_id,
                    ability: "blink".to_string(),
                    target,
                }
            }),
            (
                prop_oneof![
                    Just(StructureKind::SolarMirror),
                    Just(StructureKind::Turret),
                    Just(StructureKind::Relay)
                ],
                arb_position(extent)
            )
                .prop_map(|(structure, position)| Command::BuildStructure {
                    structure,
                    position
                }),
            (
                prop_oneof![
                    Just(UnitKind::Drone),
                    Just(UnitKind::Fighter),
                    Just(UnitKind::Frigate)
                ],
                1u32..=10
            )
                .prop_map(|(unit, count)| Command::ProduceUnit { unit, count }),
        ]
    }

    /// A valid command from one of `players` at a tick below `max_tick`.
    pub fn arb_game_command(
        players: Vec<PlayerId>,
        max_tick: u64,
        extent: i32,
    ) -> impl Strategy<Value = GameCommand> {
        let count = players.len().max(1);
        (0..count, 0..max_tick.max(1), arb_valid_command(extent)).prop_map(
            move |(index, tick, command)| {
                let player = players
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| PlayerId::from("player"));
                GameCommand::new(tick, player, command)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{move_units, pid};

    fn roster() -> Vec<PlayerId> {
        vec![pid("alice"), pid("bob")]
    }

    fn scripted(tick: u64) -> TickCommands {
        let commands = if tick % 50 == 0 {
            vec![
                move_units(tick, "alice", &[1, 2], (tick % 100) as i32, 5),
                move_units(tick, "bob", &[4], -((tick % 90) as i32), -5),
            ]
        } else {
            Vec::new()
        };
        TickCommands { tick, commands }
    }

    fn fresh() -> Arena {
        Arena::new(SeededRng::new(12345), roster(), &GameSettings::default())
    }

    #[test]
    fn test_verify_determinism_simple() {
        let result = verify_determinism(3, 500, fresh, |a, t| a.step(&scripted(t)), Arena::state_hash);
        result.assert_deterministic();
        assert_eq!(result.unique_hashes().len(), 1);
    }

    #[test]
    fn test_detects_nondeterminism() {
        let counter = std::cell::Cell::new(0u64);
        let result = verify_determinism(
            2,
            10,
            || {
                counter.set(counter.get() + 1);
                Arena::new(SeededRng::new(counter.get()), roster(), &GameSettings::default())
            },
            |a, t| a.step(&scripted(t)),
            Arena::state_hash,
        );
        assert!(!result.is_deterministic);
    }

    #[test]
    fn test_find_divergence_none_for_identical_runs() {
        let divergence = find_first_divergence(
            |_| fresh(),
            |a, _, t| a.step(&scripted(t)),
            Arena::state_hash,
            300,
        );
        assert_eq!(divergence, None);
    }

    #[test]
    fn test_find_divergence_reports_tick() {
        let divergence = find_first_divergence(
            |_| fresh(),
            |a, run, t| {
                a.step(&scripted(t));
                if run == 1 && t == 41 {
                    a.corrupt();
                }
            },
            Arena::state_hash,
            100,
        );
        assert_eq!(divergence, Some(42));
    }

    #[test]
    fn test_replay_hashes_match_live_run() {
        let ticks: Vec<TickCommands> = (0..200).map(scripted).collect();
        let mut live = fresh();
        let mut expected = Vec::new();
        for tick in &ticks {
            live.step(tick);
            expected.push(live.state_hash());
        }
        let replayed = replay_hashes(12345, &roster(), &GameSettings::default(), ticks);
        assert_eq!(replayed, expected);
    }

    mod proptest_tests {
        use super::super::strategies::*;
        use proptest::prelude::*;
        use sol_sync::config::SyncConfig;
        use sol_sync::math::Fixed;
        use sol_sync::validator::{CommandValidator, ValidationRules};

        proptest! {
            #[test]
            fn generated_commands_validate(
                command in arb_game_command(
                    vec!["alice".into(), "bob".into()],
                    10_000,
                    512,
                )
            ) {
                let rules = ValidationRules::from_config(&SyncConfig::default(), 512)
                    .with_roster(["alice".into(), "bob".into()]);
                let validator = CommandValidator::new(rules);
                prop_assert!(validator.validate(&command).is_ok(), "{:?}", command);
            }

            #[test]
            fn fractional_positions_stay_in_range(value in arb_fixed(100)) {
                prop_assert!(value >= Fixed::from_num(-100));
                prop_assert!(value < Fixed::from_num(100));
            }
        }
    }
}
