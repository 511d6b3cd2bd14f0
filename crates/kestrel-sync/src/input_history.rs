//! Per-entity input history indexed by tick.
//!
//! The client records what it sent; the server records what it was told.
//! Lookups never fail: a missing tick falls back to the nearest earlier
//! entry, and an entity with no earlier entry gets the default input.

use std::collections::{BTreeMap, HashMap};

use crate::snapshot::NetworkId;

/// Where the value returned by [`InputHistory::resolve`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// An entry recorded for exactly the requested tick.
    Exact,
    /// The nearest earlier entry, recorded at the given tick.
    Fallback(u64),
    /// No usable entry; the input type's default.
    Default,
}

/// Tick → input maps for every tracked entity.
#[derive(Debug, Clone)]
pub struct InputHistory<I> {
    entries: HashMap<NetworkId, BTreeMap<u64, I>>,
    retention_ticks: u64,
}

impl<I: Clone + Default> InputHistory<I> {
    /// Creates an empty history that keeps `retention_ticks` ticks per entity
    /// when [`InputHistory::prune`] runs.
    pub fn new(retention_ticks: u64) -> Self {
        Self {
            entries: HashMap::new(),
            retention_ticks: retention_ticks.max(1),
        }
    }

    /// Stores `input` for `tick`, replacing any earlier record for that tick.
    pub fn record(&mut self, entity: NetworkId, tick: u64, input: I) {
        self.entries.entry(entity).or_default().insert(tick, input);
    }

    /// Input effective for `entity` at `tick`.
    ///
    /// Falls back to the most recent earlier entry with a warning, or to the
    /// default input if nothing earlier exists.
    pub fn get(&self, entity: NetworkId, tick: u64) -> I {
        let (input, source) = self.resolve(entity, tick);
        match source {
            InputSource::Exact => {}
            InputSource::Fallback(from) => {
                tracing::warn!("No input for {entity} at tick {tick}, reusing tick {from}");
            }
            InputSource::Default => {
                tracing::warn!("No input for {entity} at tick {tick}, using default");
            }
        }
        input
    }

    /// Like [`InputHistory::get`] but silent, also reporting the source.
    pub fn resolve(&self, entity: NetworkId, tick: u64) -> (I, InputSource) {
        let Some(ticks) = self.entries.get(&entity) else {
            return (I::default(), InputSource::Default);
        };
        match ticks.range(..=tick).next_back() {
            Some((&at, input)) if at == tick => (input.clone(), InputSource::Exact),
            Some((&at, input)) => (input.clone(), InputSource::Fallback(at)),
            None => (I::default(), InputSource::Default),
        }
    }

    /// Returns `true` if an entry exists for exactly `tick`.
    pub fn contains(&self, entity: NetworkId, tick: u64) -> bool {
        self.entries
            .get(&entity)
            .is_some_and(|ticks| ticks.contains_key(&tick))
    }

    /// Returns `true` if anything was ever recorded for `entity`.
    pub fn tracks(&self, entity: NetworkId) -> bool {
        self.entries.contains_key(&entity)
    }

    /// Latest recorded tick for `entity`.
    pub fn latest_tick(&self, entity: NetworkId) -> Option<u64> {
        self.entries
            .get(&entity)
            .and_then(|ticks| ticks.last_key_value())
            .map(|(&tick, _)| tick)
    }

    /// Drops entries older than `tick`. The newest dropped entry of each
    /// entity is kept so later lookups still have something to fall back to.
    pub fn evict_before(&mut self, tick: u64) {
        for ticks in self.entries.values_mut() {
            let newer = ticks.split_off(&tick);
            let fallback = ticks.pop_last();
            *ticks = newer;
            if let Some((at, input)) = fallback
                && !ticks.contains_key(&tick)
            {
                ticks.insert(at, input);
            }
        }
    }

    /// Evicts everything outside the retention window ending at `current_tick`.
    pub fn prune(&mut self, current_tick: u64) {
        self.evict_before(current_tick.saturating_sub(self.retention_ticks));
    }

    /// Forgets an entity entirely (disconnect).
    pub fn remove(&mut self, entity: NetworkId) {
        self.entries.remove(&entity);
    }

    /// Number of entries held for `entity`.
    pub fn len(&self, entity: NetworkId) -> usize {
        self.entries.get(&entity).map_or(0, BTreeMap::len)
    }

    /// Number of tracked entities.
    pub fn entity_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Axis(i8);

    const PLAYER: NetworkId = NetworkId(7);

    #[test]
    fn test_record_is_idempotent_per_tick() {
        let mut history = InputHistory::new(64);
        history.record(PLAYER, 10, Axis(1));
        history.record(PLAYER, 10, Axis(-1));
        assert_eq!(history.len(PLAYER), 1);
        assert_eq!(history.get(PLAYER, 10), Axis(-1));
    }

    #[test]
    fn test_missing_tick_falls_back_to_nearest_earlier() {
        let mut history = InputHistory::new(64);
        history.record(PLAYER, 3, Axis(1));
        history.record(PLAYER, 5, Axis(-1));
        history.record(PLAYER, 9, Axis(0));

        assert_eq!(history.resolve(PLAYER, 5), (Axis(-1), InputSource::Exact));
        assert_eq!(history.resolve(PLAYER, 6), (Axis(-1), InputSource::Fallback(5)));
        assert_eq!(history.get(PLAYER, 8), history.get(PLAYER, 7));
        assert_eq!(history.get(PLAYER, 100), Axis(0));
    }

    #[test]
    fn test_nothing_earlier_gives_default() {
        let mut history = InputHistory::new(64);
        history.record(PLAYER, 10, Axis(1));
        assert_eq!(history.resolve(PLAYER, 9), (Axis(0), InputSource::Default));
        assert_eq!(
            history.resolve(NetworkId(99), 10),
            (Axis(0), InputSource::Default)
        );
    }

    #[test]
    fn test_evict_keeps_fallback_entry() {
        let mut history = InputHistory::new(64);
        for tick in 0..10 {
            history.record(PLAYER, tick, Axis(tick as i8));
        }
        history.record(PLAYER, 20, Axis(20));

        history.evict_before(15);
        assert_eq!(history.len(PLAYER), 2);
        assert_eq!(history.resolve(PLAYER, 16), (Axis(9), InputSource::Fallback(9)));
        assert_eq!(history.get(PLAYER, 20), Axis(20));
    }

    #[test]
    fn test_prune_uses_retention_window() {
        let mut history = InputHistory::new(4);
        for tick in 0..20 {
            history.record(PLAYER, tick, Axis(1));
        }
        history.prune(19);
        assert!(!history.contains(PLAYER, 14));
        assert!((15..20).all(|tick| history.contains(PLAYER, tick)));
        assert_eq!(history.latest_tick(PLAYER), Some(19));
    }

    #[test]
    fn test_remove_forgets_entity() {
        let mut history = InputHistory::new(8);
        history.record(PLAYER, 1, Axis(1));
        history.record(NetworkId(8), 1, Axis(1));
        history.remove(PLAYER);
        assert!(!history.tracks(PLAYER));
        assert_eq!(history.entity_count(), 1);
        assert_eq!(history.get(PLAYER, 1), Axis(0));
    }
}
