//! Per-player command buffers and tick resolution.
//!
//! The queue is the lockstep barrier. Each roster player has a FIFO buffer
//! in arrival order. A tick resolves only once every player has closed it
//! with a [`Command::Noop`] marker; until then [`CommandQueue::next_tick_commands`]
//! returns `None` and drains nothing, which is the stall the simulation
//! loop observes.
//!
//! Resolved commands are returned grouped by player in sorted id order and
//! FIFO within a player, so every peer applies them in the same order
//! regardless of network arrival order.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::{Command, GameCommand, PlayerId, TickCommands};

/// Diagnostic snapshot of the queue. Not used for control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Next tick waiting to resolve.
    pub next_tick: u64,
    /// Buffered commands per player.
    pub backlog: BTreeMap<PlayerId, usize>,
    /// Highest tick any buffered command targets.
    pub furthest_tick: Option<u64>,
}

/// Lockstep command queue for a fixed roster.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    buffers: BTreeMap<PlayerId, VecDeque<GameCommand>>,
    next_tick: u64,
}

impl CommandQueue {
    /// Create a queue for the full match roster. The roster never changes.
    pub fn new<I>(roster: I) -> Self
    where
        I: IntoIterator<Item = PlayerId>,
    {
        Self {
            buffers: roster
                .into_iter()
                .map(|player| (player, VecDeque::new()))
                .collect(),
            next_tick: 0,
        }
    }

    /// Players tracked by this queue, sorted.
    pub fn roster(&self) -> impl Iterator<Item = &PlayerId> {
        self.buffers.keys()
    }

    /// Next tick waiting to resolve.
    #[must_use]
    pub const fn next_tick(&self) -> u64 {
        self.next_tick
    }

    /// Append a command to its author's buffer.
    ///
    /// Returns `false` (and drops the command) when the author is not in the
    /// roster, the tick has already resolved, or the command is side-channel
    /// traffic.
    pub fn add_command(&mut self, command: GameCommand) -> bool {
        if command.command().is_state_hash() {
            warn!(player = %command.player_id(), "State hash reached the command queue, dropping");
            return false;
        }
        if command.tick() < self.next_tick {
            warn!(
                player = %command.player_id(),
                tick = command.tick(),
                next_tick = self.next_tick,
                "Dropping command for an already resolved tick"
            );
            return false;
        }
        match self.buffers.get_mut(command.player_id()) {
            Some(buffer) => {
                buffer.push_back(command);
                true
            }
            None => {
                warn!(player = %command.player_id(), "Dropping command from unknown player");
                false
            }
        }
    }

    /// True when `player` has closed `tick` with its no-op marker.
    #[must_use]
    pub fn has_contribution(&self, player: &PlayerId, tick: u64) -> bool {
        self.buffers
            .get(player)
            .is_some_and(|buffer| closes_tick(buffer, tick))
    }

    /// Players that have not yet closed `tick`.
    #[must_use]
    pub fn missing_players(&self, tick: u64) -> Vec<PlayerId> {
        self.buffers
            .iter()
            .filter(|(_, buffer)| !closes_tick(buffer, tick))
            .map(|(player, _)| player.clone())
            .collect()
    }

    /// True when the next tick can resolve.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.buffers
            .values()
            .all(|buffer| closes_tick(buffer, self.next_tick))
    }

    /// Resolve the next tick if every player has contributed to it.
    ///
    /// On success the tick's commands are drained (markers stripped) and the
    /// cursor advances. Otherwise nothing changes.
    pub fn next_tick_commands(&mut self) -> Option<TickCommands> {
        let tick = self.next_tick;
        if !self.is_ready() {
            return None;
        }

        let mut commands = Vec::new();
        for buffer in self.buffers.values_mut() {
            let mut kept = VecDeque::with_capacity(buffer.len());
            for command in buffer.drain(..) {
                if command.tick() != tick {
                    kept.push_back(command);
                } else if !matches!(command.command(), Command::Noop) {
                    commands.push(command);
                }
            }
            *buffer = kept;
        }

        self.next_tick += 1;
        debug!(tick, commands = commands.len(), "Resolved tick");
        Some(TickCommands { tick, commands })
    }

    /// Drop every buffered command. The cursor is kept.
    pub fn clear(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            next_tick: self.next_tick,
            backlog: self
                .buffers
                .iter()
                .map(|(player, buffer)| (player.clone(), buffer.len()))
                .collect(),
            furthest_tick: self
                .buffers
                .values()
                .flat_map(|buffer| buffer.iter().map(GameCommand::tick))
                .max(),
        }
    }
}

fn closes_tick(buffer: &VecDeque<GameCommand>, tick: u64) -> bool {
    buffer
        .iter()
        .any(|command| command.tick() == tick && command.command().is_noop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec2Fixed;
    use proptest::prelude::*;

    fn pid(id: &str) -> PlayerId {
        PlayerId::from(id)
    }

    fn move_cmd(tick: u64, player: &str, unit: u32) -> GameCommand {
        GameCommand::new(
            tick,
            pid(player),
            Command::MoveUnits {
                unit_ids: vec![unit],
                target: Vec2Fixed::from_ints(unit as i32, 0),
            },
        )
    }

    fn noop(tick: u64, player: &str) -> GameCommand {
        GameCommand::new(tick, pid(player), Command::Noop)
    }

    #[test]
    fn test_two_player_tick_resolves() {
        let mut queue = CommandQueue::new([pid("a"), pid("b")]);
        assert!(queue.add_command(move_cmd(0, "b", 2)));
        assert!(queue.add_command(noop(0, "b")));
        assert!(queue.next_tick_commands().is_none());

        assert!(queue.add_command(move_cmd(0, "a", 1)));
        assert!(queue.add_command(noop(0, "a")));

        let resolved = queue.next_tick_commands().unwrap();
        assert_eq!(resolved.tick, 0);
        assert_eq!(resolved.commands, vec![move_cmd(0, "a", 1), move_cmd(0, "b", 2)]);
        assert_eq!(queue.next_tick(), 1);
    }

    #[test]
    fn test_idle_tick_resolves_empty() {
        let mut queue = CommandQueue::new([pid("a"), pid("b")]);
        queue.add_command(noop(0, "a"));
        queue.add_command(noop(0, "b"));
        let resolved = queue.next_tick_commands().unwrap();
        assert!(resolved.is_idle());
    }

    #[test]
    fn test_commands_without_marker_do_not_resolve() {
        let mut queue = CommandQueue::new([pid("a")]);
        queue.add_command(move_cmd(0, "a", 1));
        assert!(queue.next_tick_commands().is_none());
        assert_eq!(queue.missing_players(0), vec![pid("a")]);
        assert_eq!(queue.stats().backlog[&pid("a")], 1);
    }

    #[test]
    fn test_contribution_needs_the_marker() {
        let mut queue = CommandQueue::new([pid("a"), pid("b")]);
        queue.add_command(move_cmd(0, "a", 1));
        assert!(!queue.has_contribution(&pid("a"), 0));

        queue.add_command(noop(0, "a"));
        assert!(queue.has_contribution(&pid("a"), 0));
        assert!(!queue.has_contribution(&pid("a"), 1));
        assert!(!queue.has_contribution(&pid("b"), 0));
        assert!(!queue.has_contribution(&pid("zed"), 0));
        assert_eq!(queue.missing_players(0), vec![pid("b")]);

        queue.add_command(noop(0, "b"));
        assert!(queue.has_contribution(&pid("b"), 0));
        assert!(queue.next_tick_commands().is_some());
        assert!(!queue.has_contribution(&pid("a"), 0));
    }

    #[test]
    fn test_future_ticks_stay_buffered() {
        let mut queue = CommandQueue::new([pid("a")]);
        queue.add_command(move_cmd(1, "a", 5));
        queue.add_command(noop(1, "a"));
        queue.add_command(noop(0, "a"));

        assert!(queue.next_tick_commands().unwrap().is_idle());
        let resolved = queue.next_tick_commands().unwrap();
        assert_eq!(resolved.tick, 1);
        assert_eq!(resolved.commands, vec![move_cmd(1, "a", 5)]);
        assert!(queue.next_tick_commands().is_none());
    }

    #[test]
    fn test_rejects_unknown_stale_and_side_channel() {
        let mut queue = CommandQueue::new([pid("a")]);
        assert!(!queue.add_command(noop(0, "zed")));
        assert!(!queue.add_command(GameCommand::new(
            0,
            pid("a"),
            Command::StateHash { hash: 1 }
        )));

        queue.add_command(noop(0, "a"));
        queue.next_tick_commands().unwrap();
        assert!(!queue.add_command(move_cmd(0, "a", 1)));
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut queue = CommandQueue::new([pid("a"), pid("b")]);
        queue.add_command(move_cmd(3, "a", 1));
        queue.add_command(noop(0, "a"));
        queue.clear();
        let stats = queue.stats();
        assert!(stats.backlog.values().all(|&n| n == 0));
        assert_eq!(stats.furthest_tick, None);
    }

    #[test]
    fn test_stats_reports_furthest_tick() {
        let mut queue = CommandQueue::new([pid("a"), pid("b")]);
        queue.add_command(move_cmd(9, "b", 1));
        queue.add_command(move_cmd(4, "a", 1));
        let stats = queue.stats();
        assert_eq!(stats.furthest_tick, Some(9));
        assert_eq!(stats.next_tick, 0);
    }

    proptest! {
        #[test]
        fn prop_barrier_requires_every_player(
            players in 1usize..6,
            missing in 0usize..6,
            extra in proptest::collection::vec(0u32..50, 0..20),
        ) {
            let missing = missing % players;
            let ids: Vec<String> = (0..players).map(|i| format!("p{i}")).collect();
            let mut queue = CommandQueue::new(ids.iter().map(|id| pid(id)));

            for (i, unit) in extra.iter().enumerate() {
                queue.add_command(move_cmd(0, &ids[i % players], *unit));
            }
            for (i, id) in ids.iter().enumerate() {
                if i != missing {
                    queue.add_command(noop(0, id));
                }
            }
            prop_assert!(queue.next_tick_commands().is_none());
            prop_assert_eq!(queue.next_tick(), 0);

            queue.add_command(noop(0, &ids[missing]));
            let resolved = queue.next_tick_commands();
            prop_assert!(resolved.is_some());
            prop_assert_eq!(resolved.unwrap().commands.len(), extra.len());
        }

        #[test]
        fn prop_fifo_per_player(units in proptest::collection::vec(0u32..1000, 1..40)) {
            let mut queue = CommandQueue::new([pid("a"), pid("b")]);
            for (i, unit) in units.iter().enumerate() {
                queue.add_command(move_cmd(0, "a", *unit));
                if i % 3 == 0 {
                    queue.add_command(move_cmd(0, "b", *unit));
                }
            }
            queue.add_command(noop(0, "b"));
            queue.add_command(noop(0, "a"));

            let resolved = queue.next_tick_commands().unwrap();
            let from_a: Vec<GameCommand> = resolved
                .commands
                .into_iter()
                .filter(|c| c.player_id() == &pid("a"))
                .collect();
            let expected: Vec<GameCommand> = units.iter().map(|u| move_cmd(0, "a", *u)).collect();
            prop_assert_eq!(from_a, expected);
        }
    }
}
