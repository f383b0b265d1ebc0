//! Field Store and Indicative Value Rule
//!
//! A [`FieldStore`] holds the last received value of every raw field for
//! one instrument. Each tick replaces only the fields it carries; the
//! indicative value is re-derived from the full merged set after every
//! tick by [`IndicativeValueRule`].
//!
//! Stores are owned by a single provider and mutated only by its
//! ingestion path while holding that instrument's lock.

use super::market_data::{FieldMap, MARKET_VALUE, fields};

// =============================================================================
// Indicative Value Rule
// =============================================================================

/// Derives one normalized price from an instrument's raw fields.
///
/// Precedence: `LAST_PRICE`, then the `BID`/`ASK` midpoint, then whichever
/// side is present alone, otherwise no value.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicativeValueRule;

impl IndicativeValueRule {
    /// Evaluate the rule against a merged field set.
    #[must_use]
    pub fn evaluate(fields: &FieldMap) -> Option<f64> {
        if let Some(last) = fields.get(fields::LAST_PRICE) {
            return Some(*last);
        }

        match (fields.get(fields::BID), fields.get(fields::ASK)) {
            (Some(bid), Some(ask)) => Some(f64::midpoint(*bid, *ask)),
            (Some(side), None) | (None, Some(side)) => Some(*side),
            (None, None) => None,
        }
    }
}

// =============================================================================
// Field Store
// =============================================================================

/// Last received value of each raw field for one instrument.
#[derive(Debug, Clone, Default)]
pub struct FieldStore {
    fields: FieldMap,
    indicative: Option<f64>,
    ticks_applied: u64,
}

impl FieldStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one tick into the store and re-derive the indicative value.
    ///
    /// Non-finite values are ignored. Returns the number of fields applied.
    pub fn merge(&mut self, tick: &FieldMap) -> usize {
        let mut applied = 0;
        for (name, value) in tick {
            if !value.is_finite() {
                tracing::debug!(field = %name, value, "Ignoring non-finite field value");
                continue;
            }
            self.fields.insert(name.clone(), *value);
            applied += 1;
        }

        self.indicative = IndicativeValueRule::evaluate(&self.fields);
        self.ticks_applied += 1;
        applied
    }

    /// Current value for a requirement's value name.
    ///
    /// [`MARKET_VALUE`] yields the indicative value, anything else the raw
    /// field of that name.
    #[must_use]
    pub fn value_for(&self, value_name: &str) -> Option<f64> {
        if value_name == MARKET_VALUE {
            self.indicative
        } else {
            self.fields.get(value_name).copied()
        }
    }

    /// Current indicative value.
    #[must_use]
    pub const fn indicative_value(&self) -> Option<f64> {
        self.indicative
    }

    /// Last received value of a raw field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    /// All merged fields.
    #[must_use]
    pub const fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Number of ticks merged so far.
    #[must_use]
    pub const fn ticks_applied(&self) -> u64 {
        self.ticks_applied
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn tick(entries: &[(&str, f64)]) -> FieldMap {
        entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test_case(&[("LAST_PRICE", 10.0), ("BID", 9.0), ("ASK", 11.5)], Some(10.0) ; "last price wins")]
    #[test_case(&[("BID", 9.0), ("ASK", 11.0)], Some(10.0) ; "bid ask midpoint")]
    #[test_case(&[("BID", 9.0)], Some(9.0) ; "bid alone")]
    #[test_case(&[("ASK", 11.0)], Some(11.0) ; "ask alone")]
    #[test_case(&[("VOLUME", 1000.0)], None ; "no price fields")]
    #[test_case(&[], None ; "empty")]
    fn rule_precedence(entries: &[(&str, f64)], expected: Option<f64>) {
        assert_eq!(IndicativeValueRule::evaluate(&tick(entries)), expected);
    }

    #[test]
    fn last_price_overrides_stale_bid_ask() {
        let mut store = FieldStore::new();

        store.merge(&tick(&[("BID", 52.07), ("ASK", 52.10)]));
        let mid = store.indicative_value().unwrap();
        assert!((mid - 52.085).abs() < 1e-6);

        store.merge(&tick(&[("LAST_PRICE", 52.15)]));
        assert!((store.indicative_value().unwrap() - 52.15).abs() < 1e-6);
        // The bid/ask pair is retained even though it no longer drives the value.
        assert_eq!(store.field("BID"), Some(52.07));
    }

    #[test]
    fn tick_replaces_only_carried_fields() {
        let mut store = FieldStore::new();

        store.merge(&tick(&[("BID", 1.0), ("ASK", 3.0)]));
        store.merge(&tick(&[("ASK", 5.0)]));

        assert_eq!(store.field("BID"), Some(1.0));
        assert_eq!(store.field("ASK"), Some(5.0));
        assert_eq!(store.indicative_value(), Some(3.0));
        assert_eq!(store.ticks_applied(), 2);
    }

    #[test]
    fn non_finite_values_are_ignored() {
        let mut store = FieldStore::new();
        store.merge(&tick(&[("BID", 4.0)]));

        let applied = store.merge(&tick(&[("BID", f64::NAN), ("ASK", f64::INFINITY)]));

        assert_eq!(applied, 0);
        assert_eq!(store.indicative_value(), Some(4.0));
    }

    #[test]
    fn value_for_selects_raw_field_or_indicative() {
        let mut store = FieldStore::new();
        store.merge(&tick(&[("BID", 2.0), ("ASK", 4.0)]));

        assert_eq!(store.value_for(MARKET_VALUE), Some(3.0));
        assert_eq!(store.value_for("BID"), Some(2.0));
        assert_eq!(store.value_for("LAST_PRICE"), None);
    }

    fn price_field() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just(fields::LAST_PRICE),
            Just(fields::BID),
            Just(fields::ASK),
        ]
    }

    fn tick_strategy() -> impl Strategy<Value = Vec<(&'static str, f64)>> {
        prop::collection::vec((price_field(), 1.0f64..1_000.0), 0..4)
    }

    proptest! {
        #[test]
        fn precedence_holds_after_every_tick(ticks in prop::collection::vec(tick_strategy(), 1..20)) {
            let mut store = FieldStore::new();
            let mut model = FieldMap::new();

            for entries in ticks {
                let t = tick(&entries);
                model.extend(t.clone());
                store.merge(&t);

                let expected = match (
                    model.get(fields::LAST_PRICE),
                    model.get(fields::BID),
                    model.get(fields::ASK),
                ) {
                    (Some(last), _, _) => Some(*last),
                    (None, Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
                    (None, Some(side), None) | (None, None, Some(side)) => Some(*side),
                    (None, None, None) => None,
                };

                match (store.indicative_value(), expected) {
                    (Some(actual), Some(want)) => prop_assert!((actual - want).abs() < 1e-9),
                    (actual, want) => prop_assert_eq!(actual, want),
                }
            }
        }
    }
}
