//! Declarative transition tables.
//!
//! Two tables are loaded from TOML data (see `data/transitions.toml`):
//!
//! - `pair`: pair state × active unit health × standby unit health → next
//!   pair state, or the `FAILOVER` sentinel
//! - `upgrade`: upgrade phase × active status × standby status → next phase
//!
//! The key `"*"` matches anything not listed at its level. A cell that
//! matches nothing yields `None`; callers keep the current state.

use std::collections::BTreeMap;
use std::path::Path;

use ttpair_model::{HighLevelState, RoleUpgradeStatus, UpgradePhase};

use crate::error::{ReconcileError, ReconcileResult};

const BUILTIN: &str = include_str!("../data/transitions.toml");
const WILDCARD: &str = "*";
const FAILOVER: &str = "FAILOVER";

/// A pair-table answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(HighLevelState),
    /// Swap the units' roles and enter `ActiveTakeover`.
    Failover,
}

type RawTable = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

#[derive(Debug, serde::Deserialize)]
struct RawTables {
    #[serde(default)]
    pair: RawTable,
    #[serde(default)]
    upgrade: RawTable,
}

/// One row or level: explicit entries plus an optional wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Level<K: Ord, V> {
    entries: BTreeMap<K, V>,
    any: Option<V>,
}

impl<K: Ord, V> Default for Level<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            any: None,
        }
    }
}

impl<K: Ord, V> Level<K, V> {
    fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).or(self.any.as_ref())
    }
}

/// Both transition tables.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    pair: BTreeMap<HighLevelState, Level<HighLevelState, Level<HighLevelState, Transition>>>,
    upgrade: BTreeMap<UpgradePhase, Level<RoleUpgradeStatus, Level<RoleUpgradeStatus, UpgradePhase>>>,
}

impl TransitionTable {
    /// The tables shipped with the operator.
    pub fn builtin() -> ReconcileResult<Self> {
        Self::from_toml_str(BUILTIN)
    }

    /// Load replacement tables from a TOML file.
    pub fn load(path: &Path) -> ReconcileResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::InvalidTransitions(format!("{}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ReconcileResult<Self> {
        let raw: RawTables =
            toml::from_str(text).map_err(|e| ReconcileError::InvalidTransitions(e.to_string()))?;

        let mut pair = BTreeMap::new();
        for (state, rows) in raw.pair {
            let state = parse_token::<HighLevelState>(&state)?;
            let level = build_level(rows, parse_pair_cell)?;
            pair.insert(state, level);
        }

        let mut upgrade = BTreeMap::new();
        for (phase, rows) in raw.upgrade {
            let phase = parse_token::<UpgradePhase>(&phase)?;
            let level = build_level(rows, |v| parse_token::<UpgradePhase>(v))?;
            upgrade.insert(phase, level);
        }

        Ok(Self { pair, upgrade })
    }

    /// Next pair state from the two units' health.
    pub fn next_pair_state(
        &self,
        state: HighLevelState,
        active: HighLevelState,
        standby: HighLevelState,
    ) -> Option<Transition> {
        self.pair
            .get(&state)?
            .get(&table_health(active))?
            .get(&table_health(standby))
            .copied()
    }

    /// Next upgrade phase from the two roles' upgrade status.
    pub fn next_upgrade_phase(
        &self,
        phase: UpgradePhase,
        active: RoleUpgradeStatus,
        standby: RoleUpgradeStatus,
    ) -> Option<UpgradePhase> {
        self.upgrade.get(&phase)?.get(&active)?.get(&standby).copied()
    }
}

/// The pair table only distinguishes plain `Healthy`.
pub fn table_health(state: HighLevelState) -> HighLevelState {
    if state.is_healthy() {
        HighLevelState::Healthy
    } else {
        state
    }
}

fn build_level<K, V, F>(
    rows: BTreeMap<String, BTreeMap<String, String>>,
    parse_value: F,
) -> ReconcileResult<Level<K, Level<K, V>>>
where
    K: Ord + std::str::FromStr<Err = ttpair_model::ModelError>,
    F: Fn(&str) -> ReconcileResult<V>,
{
    let mut outer = Level::default();
    for (row_key, cells) in rows {
        let mut inner = Level::default();
        for (cell_key, value) in cells {
            let value = parse_value(&value)?;
            if cell_key == WILDCARD {
                inner.any = Some(value);
            } else {
                inner.entries.insert(parse_token::<K>(&cell_key)?, value);
            }
        }
        if row_key == WILDCARD {
            outer.any = Some(inner);
        } else {
            outer.entries.insert(parse_token::<K>(&row_key)?, inner);
        }
    }
    Ok(outer)
}

fn parse_pair_cell(value: &str) -> ReconcileResult<Transition> {
    if value == FAILOVER {
        Ok(Transition::Failover)
    } else {
        parse_token::<HighLevelState>(value).map(Transition::To)
    }
}

fn parse_token<T>(token: &str) -> ReconcileResult<T>
where
    T: std::str::FromStr<Err = ttpair_model::ModelError>,
{
    token
        .parse()
        .map_err(|e: ttpair_model::ModelError| ReconcileError::InvalidTransitions(e.to_string()))
}
