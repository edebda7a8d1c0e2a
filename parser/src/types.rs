use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Weapon name recorded when a kill event carries no usable weapon field.
pub const UNKNOWN_WEAPON: &str = "N/A";

/// Per-capture entity identifier for units and vehicles.
/// Only meaningful inside the capture it was read from; the same player gets
/// a different id in every capture.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A human-controlled unit kept by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntity {
    pub id: EntityId,
    /// Resolved display name: the static name, or the most recent non-empty
    /// override found in the position history.
    pub name: String,
    pub side: String,
}

/// An interpreted `killed` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillEvent {
    pub victim: EntityId,
    pub killer: EntityId,
    pub weapon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaponStat {
    pub weapon: String,
    pub kills: u32,
}

/// Combat statistics for one player, either for a single capture or merged
/// across an archive. This is the stable output shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    /// In-capture entity id. For merged records, the id from the earliest
    /// capture containing the player; informational only.
    pub id: EntityId,
    pub name: String,
    pub side: String,
    pub kill_count: u32,
    pub death_count: u32,
    pub team_kill_count: u32,
    pub weapon_stats: Vec<WeaponStat>,
}

impl PlayerStats {
    /// Kills summed over the weapon breakdown. Always equal to `kill_count`.
    pub fn weapon_kills(&self) -> u32 {
        self.weapon_stats.iter().map(|w| w.kills).sum()
    }
}

/// Mutable accumulator behind a [`PlayerStats`].
///
/// Counters only move up, and a kill can only be recorded together with its
/// weapon, so `kill_count` always equals the sum of the weapon map.
#[derive(Debug, Clone)]
pub struct PlayerTally {
    id: EntityId,
    name: String,
    side: String,
    kill_count: u32,
    death_count: u32,
    team_kill_count: u32,
    weapons: HashMap<String, u32>,
}

impl PlayerTally {
    pub fn new(player: PlayerEntity) -> Self {
        Self {
            id: player.id,
            name: player.name,
            side: player.side,
            kill_count: 0,
            death_count: 0,
            team_kill_count: 0,
            weapons: HashMap::new(),
        }
    }

    /// Seed a tally from an already computed record.
    pub fn from_stats(stats: &PlayerStats) -> Self {
        let mut tally = Self::new(PlayerEntity {
            id: stats.id,
            name: stats.name.clone(),
            side: stats.side.clone(),
        });
        tally.absorb(stats);
        tally
    }

    pub fn side(&self) -> &str {
        &self.side
    }

    pub fn record_kill(&mut self, weapon: &str) {
        self.kill_count += 1;
        *self.weapons.entry(weapon.to_string()).or_default() += 1;
    }

    pub fn record_death(&mut self) {
        self.death_count += 1;
    }

    pub fn record_team_kill(&mut self) {
        self.team_kill_count += 1;
    }

    /// Take over another record's id and side, keeping all counters.
    pub fn adopt_identity(&mut self, other: &PlayerStats) {
        self.id = other.id;
        self.side = other.side.clone();
    }

    /// Fold another record's counters and weapon breakdown into this one.
    /// The other record's kill count is taken from its weapon breakdown so the
    /// kill/weapon invariant holds even for hand-built input.
    pub fn absorb(&mut self, other: &PlayerStats) {
        for stat in &other.weapon_stats {
            self.kill_count += stat.kills;
            *self.weapons.entry(stat.weapon.clone()).or_default() += stat.kills;
        }
        self.death_count += other.death_count;
        self.team_kill_count += other.team_kill_count;
    }

    /// Freeze into the output shape. Weapons are sorted by kills descending,
    /// then by name.
    pub fn into_stats(self) -> PlayerStats {
        let mut weapon_stats: Vec<WeaponStat> = self
            .weapons
            .into_iter()
            .map(|(weapon, kills)| WeaponStat { weapon, kills })
            .collect();
        weapon_stats.sort_by(|a, b| b.kills.cmp(&a.kills).then_with(|| a.weapon.cmp(&b.weapon)));

        PlayerStats {
            id: self.id,
            name: self.name,
            side: self.side,
            kill_count: self.kill_count,
            death_count: self.death_count,
            team_kill_count: self.team_kill_count,
            weapon_stats,
        }
    }
}

/// Sort records by kill count, highest first. The sort is stable, so callers
/// control tie order through the input order.
pub fn sort_by_kills(players: &mut [PlayerStats]) {
    players.sort_by(|a, b| b.kill_count.cmp(&a.kill_count));
}
