use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::analyzer::{Analyzer, CaptureRecord};
use crate::decoder::{CaptureDecoder, StreamingDecoder, open_capture};
use crate::error::Result;
use crate::types::{EntityId, KillEvent, PlayerEntity, PlayerStats, PlayerTally, sort_by_kills};

/// Builds per-player kill/death statistics for a single capture.
///
/// Players are keyed by their in-capture entity id, which is never used
/// outside this capture.
#[derive(Debug, Default)]
pub struct CaptureAggregator {
    /// Tallies in the order their entities were decoded.
    players: Vec<PlayerTally>,
    slots: HashMap<EntityId, usize>,
    entities_seen: bool,
    /// Kills that arrived before the entity list; replayed once it is known.
    /// Grows with the number of such events, so a document that lists its
    /// events first is held in memory as compact kill records.
    pending: Vec<KillEvent>,
}

impl CaptureAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_player(&mut self, player: PlayerEntity) {
        match self.slots.get(&player.id) {
            // A repeated id replaces the earlier entity but keeps its position.
            Some(&slot) => {
                debug!("entity {} listed twice, keeping the later one", player.id);
                self.players[slot] = PlayerTally::new(player);
            }
            None => {
                self.slots.insert(player.id, self.players.len());
                self.players.push(PlayerTally::new(player));
            }
        }
    }

    fn apply_kill(&mut self, kill: &KillEvent) {
        let killer = self.slots.get(&kill.killer).copied();
        let victim = self.slots.get(&kill.victim).copied();

        if let Some(killer) = killer {
            let team_kill = match victim {
                Some(victim) => {
                    kill.killer != kill.victim
                        && self.players[killer].side() == self.players[victim].side()
                }
                None => false,
            };

            let tally = &mut self.players[killer];
            tally.record_kill(&kill.weapon);
            if team_kill {
                tally.record_team_kill();
            }
        }

        if let Some(victim) = victim {
            self.players[victim].record_death();
        }
    }

    fn flush_pending(&mut self) {
        for kill in std::mem::take(&mut self.pending) {
            self.apply_kill(&kill);
        }
    }

    /// Final per-capture statistics, most kills first. Ties keep decode order.
    pub fn into_stats(mut self) -> Vec<PlayerStats> {
        self.flush_pending();
        let mut stats: Vec<PlayerStats> =
            self.players.into_iter().map(PlayerTally::into_stats).collect();
        sort_by_kills(&mut stats);
        stats
    }
}

impl Analyzer for CaptureAggregator {
    fn process(&mut self, record: CaptureRecord) {
        match record {
            CaptureRecord::Player(player) => self.add_player(player),
            CaptureRecord::EntitiesEnd => {
                self.entities_seen = true;
                self.flush_pending();
            }
            CaptureRecord::Kill(kill) => {
                if self.entities_seen {
                    self.apply_kill(&kill);
                } else {
                    self.pending.push(kill);
                }
            }
        }
    }

    fn finish(&mut self) {
        if !self.entities_seen && !self.pending.is_empty() {
            debug!("capture has no entity list, dropping {} kill events", self.pending.len());
            self.pending.clear();
        }
    }
}

/// Decode and aggregate one capture file with the streaming decoder.
pub fn process_capture(path: &Path) -> Result<Vec<PlayerStats>> {
    process_capture_with(&StreamingDecoder, path)
}

pub fn process_capture_with(decoder: &dyn CaptureDecoder, path: &Path) -> Result<Vec<PlayerStats>> {
    let mut reader = open_capture(path)?;
    let mut aggregator = CaptureAggregator::new();
    decoder.decode(&mut reader, &mut aggregator)?;
    Ok(aggregator.into_stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{UNKNOWN_WEAPON, WeaponStat};

    fn player(id: i64, name: &str, side: &str) -> CaptureRecord {
        CaptureRecord::Player(PlayerEntity {
            id: EntityId(id),
            name: name.to_string(),
            side: side.to_string(),
        })
    }

    fn kill(victim: i64, killer: i64, weapon: &str) -> CaptureRecord {
        CaptureRecord::Kill(KillEvent {
            victim: EntityId(victim),
            killer: EntityId(killer),
            weapon: weapon.to_string(),
        })
    }

    fn aggregate(records: Vec<CaptureRecord>) -> Vec<PlayerStats> {
        let mut aggregator = CaptureAggregator::new();
        for record in records {
            aggregator.process(record);
        }
        aggregator.finish();
        aggregator.into_stats()
    }

    fn by_name<'a>(stats: &'a [PlayerStats], name: &str) -> &'a PlayerStats {
        stats.iter().find(|p| p.name == name).unwrap()
    }

    #[test]
    fn single_kill_credits_killer_and_victim() {
        let stats = aggregate(vec![
            player(1, "A", "WEST"),
            player(2, "B", "EAST"),
            CaptureRecord::EntitiesEnd,
            kill(2, 1, "Rifle"),
        ]);

        let a = by_name(&stats, "A");
        assert_eq!(a.kill_count, 1);
        assert_eq!(a.death_count, 0);
        assert_eq!(a.weapon_stats, vec![WeaponStat { weapon: "Rifle".into(), kills: 1 }]);
        let b = by_name(&stats, "B");
        assert_eq!(b.kill_count, 0);
        assert_eq!(b.death_count, 1);
        assert_eq!(stats[0].name, "A");
    }

    #[test]
    fn team_kill_counts_for_killer_only() {
        let stats = aggregate(vec![
            player(1, "A", "WEST"),
            player(2, "B", "WEST"),
            CaptureRecord::EntitiesEnd,
            kill(2, 1, "Rifle"),
        ]);

        assert_eq!(by_name(&stats, "A").team_kill_count, 1);
        assert_eq!(by_name(&stats, "B").team_kill_count, 0);
        assert_eq!(by_name(&stats, "B").death_count, 1);
    }

    #[test]
    fn self_kill_is_never_a_team_kill() {
        let stats = aggregate(vec![
            player(1, "A", "WEST"),
            CaptureRecord::EntitiesEnd,
            kill(1, 1, "Grenade"),
        ]);

        let a = by_name(&stats, "A");
        assert_eq!(a.kill_count, 1);
        assert_eq!(a.death_count, 1);
        assert_eq!(a.team_kill_count, 0);
        assert_eq!(a.weapon_stats[0].weapon, "Grenade");
    }

    #[test]
    fn unknown_ids_only_affect_resolved_side() {
        let stats = aggregate(vec![
            player(1, "A", "WEST"),
            player(2, "B", "EAST"),
            CaptureRecord::EntitiesEnd,
            // Killed an AI unit.
            kill(99, 1, "Rifle"),
            // Killed by a vehicle or AI.
            kill(2, 50, "Cannon"),
        ]);

        let a = by_name(&stats, "A");
        assert_eq!((a.kill_count, a.death_count, a.team_kill_count), (1, 0, 0));
        let b = by_name(&stats, "B");
        assert_eq!((b.kill_count, b.death_count, b.team_kill_count), (0, 1, 0));
        assert!(b.weapon_stats.is_empty());
    }

    #[test]
    fn kill_count_matches_weapon_breakdown() {
        let stats = aggregate(vec![
            player(1, "A", "WEST"),
            player(2, "B", "EAST"),
            player(3, "C", "WEST"),
            CaptureRecord::EntitiesEnd,
            kill(2, 1, "Rifle"),
            kill(3, 1, UNKNOWN_WEAPON),
            kill(1, 2, "MG"),
            kill(2, 2, "MG"),
            kill(1, 3, "Rifle"),
            kill(77, 3, "Rifle"),
        ]);

        for p in &stats {
            assert_eq!(p.kill_count, p.weapon_kills(), "{}", p.name);
        }
        assert_eq!(by_name(&stats, "A").team_kill_count, 1);
        assert_eq!(by_name(&stats, "C").team_kill_count, 1);
    }

    #[test]
    fn sorted_by_kills_with_ties_in_decode_order() {
        let stats = aggregate(vec![
            player(1, "A", "WEST"),
            player(2, "B", "EAST"),
            player(3, "C", "EAST"),
            CaptureRecord::EntitiesEnd,
            kill(1, 3, "Rifle"),
        ]);

        let names: Vec<_> = stats.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);
    }

    #[test]
    fn weapons_sorted_by_kills() {
        let stats = aggregate(vec![
            player(1, "A", "WEST"),
            CaptureRecord::EntitiesEnd,
            kill(5, 1, "Pistol"),
            kill(6, 1, "Rifle"),
            kill(7, 1, "Rifle"),
        ]);

        let weapons: Vec<_> = stats[0].weapon_stats.iter().map(|w| w.weapon.as_str()).collect();
        assert_eq!(weapons, vec!["Rifle", "Pistol"]);
    }

    #[test]
    fn kills_before_entities_are_replayed() {
        let stats = aggregate(vec![
            kill(2, 1, "Rifle"),
            player(1, "A", "WEST"),
            player(2, "B", "EAST"),
            CaptureRecord::EntitiesEnd,
        ]);

        assert_eq!(by_name(&stats, "A").kill_count, 1);
        assert_eq!(by_name(&stats, "B").death_count, 1);
    }

    #[test]
    fn duplicate_entity_id_replaces_earlier_entity() {
        let stats = aggregate(vec![
            player(1, "Old", "WEST"),
            player(1, "New", "EAST"),
            CaptureRecord::EntitiesEnd,
            kill(9, 1, "Rifle"),
        ]);

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "New");
        assert_eq!(stats[0].side, "EAST");
    }

    #[test]
    fn kill_without_weapon_is_credited_to_unknown_weapon() {
        use crate::archive::tests::write_capture;
        use crate::decoder::BufferedDecoder;
        use serde_json::json;

        let dir = tempfile::tempdir().unwrap();
        let path = write_capture(
            dir.path(),
            "no_weapon.gz",
            &json!({
                "entities": [
                    {"type": "unit", "id": 1, "name": "A", "side": "WEST", "isPlayer": 1},
                    {"type": "unit", "id": 2, "name": "B", "side": "EAST", "isPlayer": 1}
                ],
                "events": [[10, "killed", 2, [1], 50]]
            }),
        );

        for stats in [
            process_capture(&path).unwrap(),
            process_capture_with(&BufferedDecoder, &path).unwrap(),
        ] {
            let a = by_name(&stats, "A");
            assert_eq!(a.kill_count, 1);
            assert_eq!(
                a.weapon_stats,
                vec![WeaponStat { weapon: UNKNOWN_WEAPON.into(), kills: 1 }]
            );
            assert_eq!(by_name(&stats, "B").death_count, 1);
        }
    }

    #[test]
    fn capture_without_entities_has_no_players() {
        let stats = aggregate(vec![kill(2, 1, "Rifle")]);
        assert!(stats.is_empty());
    }
}
