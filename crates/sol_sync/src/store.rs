//! Match persistence.
//!
//! The network manager only needs a handful of asynchronous calls against
//! whatever stores matches and their rosters. [`MatchStore`] is that seam;
//! [`MemoryMatchStore`] is the in-process implementation shared by every
//! peer of a local test rig or headless run.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::command::{MatchId, PlayerId};
use crate::config::DEFAULT_TICK_RATE;
use crate::error::StoreError;

/// Lifecycle status persisted for a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Accepting players.
    Open,
    /// Peers are connecting.
    Connecting,
    /// Ticks are flowing.
    Active,
    /// Finished.
    Ended,
}

/// Per-match gameplay settings shared with every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    /// Half the map side length in world units; positions must stay within.
    pub map_half_extent: i32,
    /// Solarium each player starts with.
    pub starting_solarium: u32,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            map_half_extent: 512,
            starting_solarium: 500,
        }
    }
}

/// Persisted match record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Match id.
    pub id: MatchId,
    /// Lifecycle status.
    pub status: MatchStatus,
    /// Player who created the match.
    pub host_player_id: PlayerId,
    /// Seed every peer derives its RNG from.
    pub game_seed: u64,
    /// Ticks per second.
    pub tick_rate: u32,
    /// Whether peers exchange state hashes.
    pub lockstep_enabled: bool,
    /// Seat limit.
    pub max_players: usize,
    /// Display name.
    pub match_name: String,
    /// Gameplay settings.
    pub game_settings: GameSettings,
}

/// Playable factions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Faction {
    /// Light-focused faction.
    Radiant,
    /// Wealth-oriented faction.
    Aurum,
    /// Sun-worshipping faction.
    Solari,
}

/// A seat in a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPlayer {
    /// Player id.
    pub player_id: PlayerId,
    /// Name shown in the lobby.
    pub display_name: String,
    /// True for the match host.
    pub is_host: bool,
    /// Seat index, starting at 0 for the host.
    pub seat: usize,
    /// Chosen faction, if picked yet.
    pub faction: Option<Faction>,
}

impl MatchPlayer {
    /// A seat without a faction, named after the player id.
    #[must_use]
    pub fn new(player_id: PlayerId, seat: usize, is_host: bool) -> Self {
        Self {
            display_name: player_id.to_string(),
            player_id,
            is_host,
            seat,
            faction: None,
        }
    }
}

/// Options for creating a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateMatchOptions {
    /// Display name.
    pub name: String,
    /// Seat limit.
    pub max_players: usize,
    /// Ticks per second.
    pub tick_rate: u32,
    /// Whether peers exchange state hashes.
    pub lockstep_enabled: bool,
    /// Fixed seed; generated when absent.
    pub seed: Option<u64>,
    /// Gameplay settings.
    pub settings: GameSettings,
}

impl Default for CreateMatchOptions {
    fn default() -> Self {
        Self {
            name: "Skirmish".to_string(),
            max_players: 2,
            tick_rate: DEFAULT_TICK_RATE,
            lockstep_enabled: true,
            seed: None,
            settings: GameSettings::default(),
        }
    }
}

/// Everything a store needs to create a match. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMatch {
    /// Creating player.
    pub host_player_id: PlayerId,
    /// Resolved seed.
    pub game_seed: u64,
    /// Requested options.
    pub options: CreateMatchOptions,
}

/// Asynchronous persistence collaborator.
///
/// Calls are awaited one at a time by the manager; implementations may hit
/// the network.
#[allow(async_fn_in_trait)]
pub trait MatchStore {
    /// Persist a new `Open` match.
    async fn create_match(&self, new_match: NewMatch) -> Result<Match, StoreError>;

    /// Matches currently accepting players.
    async fn list_open_matches(&self) -> Result<Vec<Match>, StoreError>;

    /// Fetch a match, `None` if it does not exist.
    async fn get_match(&self, match_id: &MatchId) -> Result<Option<Match>, StoreError>;

    /// Roster of a match, ordered by seat.
    async fn list_players(&self, match_id: &MatchId) -> Result<Vec<MatchPlayer>, StoreError>;

    /// Add a seat.
    async fn insert_player(&self, match_id: &MatchId, player: MatchPlayer)
        -> Result<(), StoreError>;

    /// Replace an existing seat.
    async fn update_player(&self, match_id: &MatchId, player: MatchPlayer)
        -> Result<(), StoreError>;

    /// Remove a seat. Returns whether it existed.
    async fn remove_player(&self, match_id: &MatchId, player: &PlayerId)
        -> Result<bool, StoreError>;

    /// Change a match's status.
    async fn update_match_status(
        &self,
        match_id: &MatchId,
        status: MatchStatus,
    ) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct StoredMatch {
    record: Match,
    players: Vec<MatchPlayer>,
}

#[derive(Debug, Default)]
struct MemoryState {
    matches: BTreeMap<MatchId, StoredMatch>,
    /// Insertion order, so listings are stable.
    order: Vec<MatchId>,
    failing: bool,
}

/// In-process [`MatchStore`]. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryMatchStore {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryMatchStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a backend error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state.borrow_mut().failing = failing;
    }

    /// Number of matches stored.
    #[must_use]
    pub fn match_count(&self) -> usize {
        self.state.borrow().matches.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.state.borrow().failing {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    fn with_match<T>(
        &self,
        match_id: &MatchId,
        f: impl FnOnce(&mut StoredMatch) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        let stored = state
            .matches
            .get_mut(match_id)
            .ok_or_else(|| StoreError::MatchNotFound(match_id.to_string()))?;
        f(stored)
    }
}

impl MatchStore for MemoryMatchStore {
    async fn create_match(&self, new_match: NewMatch) -> Result<Match, StoreError> {
        self.check()?;
        let NewMatch {
            host_player_id,
            game_seed,
            options,
        } = new_match;
        let record = Match {
            id: MatchId::new(Uuid::new_v4().to_string()),
            status: MatchStatus::Open,
            host_player_id,
            game_seed,
            tick_rate: options.tick_rate,
            lockstep_enabled: options.lockstep_enabled,
            max_players: options.max_players,
            match_name: options.name,
            game_settings: options.settings,
        };

        let mut state = self.state.borrow_mut();
        state.order.push(record.id.clone());
        state.matches.insert(
            record.id.clone(),
            StoredMatch {
                record: record.clone(),
                players: Vec::new(),
            },
        );
        debug!(match_id = %record.id, seed = game_seed, "Stored new match");
        Ok(record)
    }

    async fn list_open_matches(&self) -> Result<Vec<Match>, StoreError> {
        self.check()?;
        let state = self.state.borrow();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.matches.get(id))
            .map(|stored| stored.record.clone())
            .filter(|record| record.status == MatchStatus::Open)
            .collect())
    }

    async fn get_match(&self, match_id: &MatchId) -> Result<Option<Match>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .borrow()
            .matches
            .get(match_id)
            .map(|stored| stored.record.clone()))
    }

    async fn list_players(&self, match_id: &MatchId) -> Result<Vec<MatchPlayer>, StoreError> {
        self.with_match(match_id, |stored| {
            let mut players = stored.players.clone();
            players.sort_by_key(|player| player.seat);
            Ok(players)
        })
    }

    async fn insert_player(
        &self,
        match_id: &MatchId,
        player: MatchPlayer,
    ) -> Result<(), StoreError> {
        self.with_match(match_id, |stored| {
            if let Some(existing) = stored
                .players
                .iter_mut()
                .find(|p| p.player_id == player.player_id)
            {
                *existing = player;
            } else {
                stored.players.push(player);
            }
            Ok(())
        })
    }

    async fn update_player(
        &self,
        match_id: &MatchId,
        player: MatchPlayer,
    ) -> Result<(), StoreError> {
        self.with_match(match_id, |stored| {
            let existing = stored
                .players
                .iter_mut()
                .find(|p| p.player_id == player.player_id)
                .ok_or_else(|| StoreError::PlayerNotFound {
                    match_id: match_id.to_string(),
                    player: player.player_id.to_string(),
                })?;
            *existing = player;
            Ok(())
        })
    }

    async fn remove_player(
        &self,
        match_id: &MatchId,
        player: &PlayerId,
    ) -> Result<bool, StoreError> {
        self.with_match(match_id, |stored| {
            let before = stored.players.len();
            stored.players.retain(|p| &p.player_id != player);
            Ok(stored.players.len() != before)
        })
    }

    async fn update_match_status(
        &self,
        match_id: &MatchId,
        status: MatchStatus,
    ) -> Result<(), StoreError> {
        self.with_match(match_id, |stored| {
            debug!(match_id = %stored.record.id, ?status, "Match status updated");
            stored.record.status = status;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_match(host: &str) -> NewMatch {
        NewMatch {
            host_player_id: PlayerId::from(host),
            game_seed: 42,
            options: CreateMatchOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let store = MemoryMatchStore::new();
        let created = store.create_match(new_match("host")).await.unwrap();
        assert_eq!(created.status, MatchStatus::Open);
        assert_eq!(created.game_seed, 42);
        assert_eq!(created.tick_rate, DEFAULT_TICK_RATE);

        let fetched = store.get_match(&created.id).await.unwrap();
        assert_eq!(fetched, Some(created));
        assert_eq!(store.get_match(&MatchId::from("nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_tables() {
        let store = MemoryMatchStore::new();
        let other = store.clone();
        let created = store.create_match(new_match("host")).await.unwrap();
        assert!(other.get_match(&created.id).await.unwrap().is_some());
        assert_eq!(other.match_count(), 1);
    }

    #[tokio::test]
    async fn test_open_listing_follows_status() {
        let store = MemoryMatchStore::new();
        let first = store.create_match(new_match("a")).await.unwrap();
        let second = store.create_match(new_match("b")).await.unwrap();
        store
            .update_match_status(&first.id, MatchStatus::Active)
            .await
            .unwrap();

        let open = store.list_open_matches().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second.id);
    }

    #[tokio::test]
    async fn test_roster_is_ordered_by_seat() {
        let store = MemoryMatchStore::new();
        let created = store.create_match(new_match("host")).await.unwrap();
        store
            .insert_player(&created.id, MatchPlayer::new(PlayerId::from("zed"), 1, false))
            .await
            .unwrap();
        store
            .insert_player(&created.id, MatchPlayer::new(PlayerId::from("host"), 0, true))
            .await
            .unwrap();

        let players = store.list_players(&created.id).await.unwrap();
        let ids: Vec<&str> = players.iter().map(|p| p.player_id.as_str()).collect();
        assert_eq!(ids, vec!["host", "zed"]);

        let mut renamed = players[1].clone();
        renamed.faction = Some(Faction::Aurum);
        store.update_player(&created.id, renamed).await.unwrap();
        assert!(store
            .remove_player(&created.id, &PlayerId::from("zed"))
            .await
            .unwrap());
        assert_eq!(store.list_players(&created.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_records_error() {
        let store = MemoryMatchStore::new();
        let missing = MatchId::from("missing");
        assert_eq!(
            store.list_players(&missing).await,
            Err(StoreError::MatchNotFound("missing".to_string()))
        );

        let created = store.create_match(new_match("host")).await.unwrap();
        let ghost = MatchPlayer::new(PlayerId::from("ghost"), 3, false);
        assert!(matches!(
            store.update_player(&created.id, ghost).await,
            Err(StoreError::PlayerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let store = MemoryMatchStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.create_match(new_match("host")).await,
            Err(StoreError::Backend(_))
        ));
        store.set_failing(false);
        assert!(store.create_match(new_match("host")).await.is_ok());
    }
}
