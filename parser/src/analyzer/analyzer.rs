use crate::types::{KillEvent, PlayerEntity};

/// One item produced by a capture decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRecord {
    /// A human-controlled unit from the `entities` array.
    Player(PlayerEntity),
    /// The `entities` array has been fully read.
    EntitiesEnd,
    /// A `killed` event from the `events` array.
    Kill(KillEvent),
}

pub trait Analyzer {
    fn process(&mut self, record: CaptureRecord);
    fn finish(&mut self);
}
