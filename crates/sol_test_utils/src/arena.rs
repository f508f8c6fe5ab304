//! Reference arena simulation.
//!
//! A small deterministic world that consumes resolved tick commands and the
//! match RNG the same way a real SoL simulation would. Every peer of a test
//! match runs its own [`Arena`]; matching state hashes across peers show the
//! sync core delivered identical input.
//!
//! The rules are deliberately simple:
//! - Each player owns a forge and a few starting drones
//! - Commands only affect units owned by their author
//! - Solar mirrors raise a player's solarium income
//! - Solar flares, spawn jitter and asteroid placement draw from the RNG

use std::collections::BTreeMap;

use sol_sync::command::{Command, GameCommand, PlayerId, StructureKind, TickCommands, UnitKind};
use sol_sync::hash::StateHasher;
use sol_sync::math::{Fixed, Vec2Fixed};
use sol_sync::rng::SeededRng;
use sol_sync::store::GameSettings;

/// Drones each player starts with.
pub const STARTING_DRONES: u32 = 3;

/// Units this close to their attack target deal damage.
const ATTACK_RANGE: i32 = 24;

/// A unit in the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaUnit {
    /// Unit id, unique across the arena.
    pub id: u32,
    /// Owner.
    pub owner: PlayerId,
    /// Unit type.
    pub kind: UnitKind,
    /// Current position.
    pub position: Vec2Fixed,
    /// Move order, if any.
    pub destination: Option<Vec2Fixed>,
    /// Attack order, if any.
    pub attack_target: Option<u32>,
    /// Remaining health.
    pub health: i32,
}

/// Per-player economy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaPlayer {
    /// Forge location; production spawns here.
    pub forge: Vec2Fixed,
    /// Current solarium.
    pub solarium: i64,
    /// Solar mirrors built.
    pub mirrors: u32,
    /// Other structures built.
    pub structures: u32,
}

/// Deterministic toy world driven by tick commands.
#[derive(Debug, Clone)]
pub struct Arena {
    tick: u64,
    rng: SeededRng,
    extent: Fixed,
    players: BTreeMap<PlayerId, ArenaPlayer>,
    units: BTreeMap<u32, ArenaUnit>,
    asteroids: Vec<Vec2Fixed>,
    next_unit_id: u32,
}

impl Arena {
    /// Lay out a fresh arena. Initial placement consumes `rng`.
    pub fn new<I>(mut rng: SeededRng, roster: I, settings: &GameSettings) -> Self
    where
        I: IntoIterator<Item = PlayerId>,
    {
        let mut roster: Vec<PlayerId> = roster.into_iter().collect();
        roster.sort();
        let half = settings.map_half_extent.max(64);
        let extent = Fixed::from_num(half);

        let asteroid_count = rng.next_int(4, 12);
        let asteroids = (0..asteroid_count)
            .map(|_| {
                let x = rng.next_int(-i64::from(half), i64::from(half));
                let y = rng.next_int(-i64::from(half), i64::from(half));
                Vec2Fixed::from_ints(x as i32, y as i32)
            })
            .collect();

        let mut arena = Self {
            tick: 0,
            rng,
            extent,
            players: BTreeMap::new(),
            units: BTreeMap::new(),
            asteroids,
            next_unit_id: 1,
        };

        let spacing = half / 2;
        for (seat, player) in roster.into_iter().enumerate() {
            let corner = if seat % 2 == 0 { -spacing } else { spacing };
            let forge = Vec2Fixed::from_ints(corner, corner - (seat as i32 / 2) * 8);
            arena.players.insert(
                player.clone(),
                ArenaPlayer {
                    forge,
                    solarium: i64::from(settings.starting_solarium),
                    mirrors: 0,
                    structures: 0,
                },
            );
            for _ in 0..STARTING_DRONES {
                arena.spawn(&player, UnitKind::Drone);
            }
        }
        arena
    }

    /// Ticks simulated so far.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Unit lookup.
    #[must_use]
    pub fn unit(&self, id: u32) -> Option<&ArenaUnit> {
        self.units.get(&id)
    }

    /// Every living unit, by ascending id.
    pub fn units(&self) -> impl Iterator<Item = &ArenaUnit> {
        self.units.values()
    }

    /// Ids of `player`'s living units, ascending.
    #[must_use]
    pub fn units_of(&self, player: &PlayerId) -> Vec<u32> {
        self.units
            .values()
            .filter(|u| &u.owner == player)
            .map(|u| u.id)
            .collect()
    }

    /// Economy of `player`.
    #[must_use]
    pub fn player(&self, player: &PlayerId) -> Option<&ArenaPlayer> {
        self.players.get(player)
    }

    /// Number of asteroids.
    #[must_use]
    pub fn asteroid_count(&self) -> usize {
        self.asteroids.len()
    }

    /// Apply a resolved tick, then advance the world by one step.
    pub fn step(&mut self, resolved: &TickCommands) {
        for command in &resolved.commands {
            self.apply(command);
        }
        self.simulate();
        self.tick += 1;
    }

    /// Apply one command. Commands touching units their author does not own
    /// are ignored.
    pub fn apply(&mut self, command: &GameCommand) {
        let author = command.player_id();
        match command.command() {
            Command::MoveUnits { unit_ids, target } => {
                let target = self.clamp(*target);
                for id in unit_ids {
                    if let Some(unit) = self.owned_mut(author, *id) {
                        unit.destination = Some(target);
                        unit.attack_target = None;
                    }
                }
            }
            Command::Attack {
                unit_ids,
                target_id,
            } => {
                if !self.units.contains_key(target_id) {
                    return;
                }
                for id in unit_ids {
                    if let Some(unit) = self.owned_mut(author, *id) {
                        unit.attack_target = Some(*target_id);
                        unit.destination = None;
                    }
                }
            }
            Command::CastAbility {
                unit_id,
                ability,
                target,
            } => self.cast(author, *unit_id, ability, *target),
            Command::BuildStructure {
                structure,
                position,
            } => self.build(author, *structure, *position),
            Command::ProduceUnit { unit, count } => {
                for _ in 0..*count {
                    if !self.spend(author, unit_cost(*unit)) {
                        break;
                    }
                    self.spawn(author, *unit);
                }
            }
            Command::Noop | Command::StateHash { .. } => {}
        }
    }

    /// Nudge one unit out of place, producing a state only this peer has.
    pub fn corrupt(&mut self) {
        if let Some(unit) = self.units.values_mut().next() {
            unit.position.x = unit.position.x.saturating_add(Fixed::ONE);
        }
    }

    /// Hash of the full world state.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut hasher = StateHasher::new();
        hasher.write_u64(self.tick).write_u64(self.rng.state());
        for (id, player) in &self.players {
            hasher
                .write_str(id.as_str())
                .write_vec2(player.forge)
                .write_i64(player.solarium)
                .write_u32(player.mirrors)
                .write_u32(player.structures);
        }
        for unit in self.units.values() {
            hasher
                .write_u32(unit.id)
                .write_str(unit.owner.as_str())
                .write_u32(unit.kind as u32)
                .write_vec2(unit.position)
                .write_u64(u64::from(unit.destination.is_some()))
                .write_u32(unit.attack_target.unwrap_or(0))
                .write_i64(i64::from(unit.health));
        }
        for asteroid in &self.asteroids {
            hasher.write_vec2(*asteroid);
        }
        hasher.finish()
    }

    fn simulate(&mut self) {
        for player in self.players.values_mut() {
            player.solarium += 1 + i64::from(player.mirrors) * 2;
        }

        // Solar flare: one random player gets a burst of solarium
        if self.rng.chance(5) && !self.players.is_empty() {
            let index = self.rng.next_int(0, self.players.len() as i64 - 1) as usize;
            if let Some(player) = self.players.values_mut().nth(index) {
                player.solarium += 25;
            }
        }

        let positions: BTreeMap<u32, Vec2Fixed> =
            self.units.iter().map(|(id, u)| (*id, u.position)).collect();
        let range_sq = Fixed::from_num(ATTACK_RANGE * ATTACK_RANGE);
        let mut damage: BTreeMap<u32, i32> = BTreeMap::new();

        for unit in self.units.values_mut() {
            let speed = unit_speed(unit.kind);
            if let Some(target_id) = unit.attack_target {
                match positions.get(&target_id) {
                    Some(&target_pos) => {
                        if unit.position.distance_squared(target_pos) <= range_sq {
                            *damage.entry(target_id).or_default() += unit_damage(unit.kind);
                        } else {
                            unit.position = unit.position.step_towards(target_pos, speed);
                        }
                    }
                    None => unit.attack_target = None,
                }
            } else if let Some(destination) = unit.destination {
                unit.position = unit.position.step_towards(destination, speed);
                if unit.position == destination {
                    unit.destination = None;
                }
            }
        }

        for (id, amount) in damage {
            if let Some(unit) = self.units.get_mut(&id) {
                unit.health -= amount;
            }
        }
        self.units.retain(|_, unit| unit.health > 0);
    }

    fn cast(&mut self, author: &PlayerId, unit_id: u32, ability: &str, target: Option<Vec2Fixed>) {
        let target = target.map(|t| self.clamp(t));
        let Some(unit) = self.owned_mut(author, unit_id) else {
            return;
        };
        match (ability, target) {
            ("blink", Some(target)) => {
                unit.position = unit.position.step_towards(target, Fixed::from_num(40));
            }
            ("overcharge", _) => {
                unit.health = (unit.health + 10).min(max_health(unit.kind));
            }
            _ => {}
        }
    }

    fn build(&mut self, author: &PlayerId, structure: StructureKind, position: Vec2Fixed) {
        if !position.within_extent(self.extent) || !self.spend(author, structure_cost(structure)) {
            return;
        }
        if let Some(player) = self.players.get_mut(author) {
            match structure {
                StructureKind::SolarMirror => player.mirrors += 1,
                StructureKind::Turret | StructureKind::Relay => player.structures += 1,
            }
        }
    }

    fn spawn(&mut self, owner: &PlayerId, kind: UnitKind) {
        let Some(forge) = self.players.get(owner).map(|p| p.forge) else {
            return;
        };
        let jitter_x = self.rng.next_int(-8, 8) as i32;
        let jitter_y = self.rng.next_int(-8, 8) as i32;
        let position = self.clamp(forge + Vec2Fixed::from_ints(jitter_x, jitter_y));
        let id = self.next_unit_id;
        self.next_unit_id += 1;
        self.units.insert(
            id,
            ArenaUnit {
                id,
                owner: owner.clone(),
                kind,
                position,
                destination: None,
                attack_target: None,
                health: max_health(kind),
            },
        );
    }

    fn spend(&mut self, author: &PlayerId, cost: i64) -> bool {
        match self.players.get_mut(author) {
            Some(player) if player.solarium >= cost => {
                player.solarium -= cost;
                true
            }
            _ => false,
        }
    }

    fn owned_mut(&mut self, author: &PlayerId, id: u32) -> Option<&mut ArenaUnit> {
        self.units.get_mut(&id).filter(|unit| &unit.owner == author)
    }

    fn clamp(&self, position: Vec2Fixed) -> Vec2Fixed {
        Vec2Fixed::new(
            position.x.clamp(-self.extent, self.extent),
            position.y.clamp(-self.extent, self.extent),
        )
    }
}

fn unit_speed(kind: UnitKind) -> Fixed {
    match kind {
        UnitKind::Drone => Fixed::from_num(2),
        UnitKind::Fighter => Fixed::from_num(4),
        UnitKind::Frigate => Fixed::ONE,
    }
}

fn unit_damage(kind: UnitKind) -> i32 {
    match kind {
        UnitKind::Drone => 1,
        UnitKind::Fighter => 4,
        UnitKind::Frigate => 9,
    }
}

fn max_health(kind: UnitKind) -> i32 {
    match kind {
        UnitKind::Drone => 40,
        UnitKind::Fighter => 70,
        UnitKind::Frigate => 200,
    }
}

fn unit_cost(kind: UnitKind) -> i64 {
    match kind {
        UnitKind::Drone => 50,
        UnitKind::Fighter => 120,
        UnitKind::Frigate => 300,
    }
}

fn structure_cost(kind: StructureKind) -> i64 {
    match kind {
        StructureKind::SolarMirror => 100,
        StructureKind::Turret => 150,
        StructureKind::Relay => 75,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: &str) -> PlayerId {
        PlayerId::from(id)
    }

    fn arena(seed: u64) -> Arena {
        Arena::new(
            SeededRng::new(seed),
            [pid("alice"), pid("bob")],
            &GameSettings::default(),
        )
    }

    fn resolved(tick: u64, commands: Vec<GameCommand>) -> TickCommands {
        TickCommands { tick, commands }
    }

    #[test]
    fn test_same_seed_same_layout() {
        assert_eq!(arena(7).state_hash(), arena(7).state_hash());
        assert_ne!(arena(7).state_hash(), arena(8).state_hash());
        assert_eq!(arena(7).units_of(&pid("alice")).len(), STARTING_DRONES as usize);
    }

    #[test]
    fn test_move_reaches_destination() {
        let mut world = arena(1);
        let unit = world.units_of(&pid("alice"))[0];
        let order = GameCommand::new(
            0,
            pid("alice"),
            Command::MoveUnits {
                unit_ids: vec![unit],
                target: Vec2Fixed::from_ints(10, 10),
            },
        );
        world.step(&resolved(0, vec![order]));
        for tick in 1..1_000 {
            world.step(&resolved(tick, Vec::new()));
        }
        assert_eq!(world.unit(unit).unwrap().position, Vec2Fixed::from_ints(10, 10));
    }

    #[test]
    fn test_foreign_units_are_untouched() {
        let mut world = arena(1);
        let bobs = world.units_of(&pid("bob"))[0];
        let before = world.unit(bobs).unwrap().clone();
        let order = GameCommand::new(
            0,
            pid("alice"),
            Command::MoveUnits {
                unit_ids: vec![bobs],
                target: Vec2Fixed::from_ints(0, 0),
            },
        );
        world.apply(&order);
        assert_eq!(world.unit(bobs), Some(&before));
    }

    #[test]
    fn test_production_spends_solarium() {
        let mut world = arena(3);
        let start = world.player(&pid("bob")).unwrap().solarium;
        world.apply(&GameCommand::new(
            0,
            pid("bob"),
            Command::ProduceUnit {
                unit: UnitKind::Fighter,
                count: 2,
            },
        ));
        assert_eq!(world.player(&pid("bob")).unwrap().solarium, start - 240);
        assert_eq!(world.units_of(&pid("bob")).len(), STARTING_DRONES as usize + 2);
    }

    #[test]
    fn test_corrupt_changes_hash() {
        let mut world = arena(5);
        let before = world.state_hash();
        world.corrupt();
        assert_ne!(world.state_hash(), before);
    }
}
