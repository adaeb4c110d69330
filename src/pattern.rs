//! Client-side unit filtering for managers without `ListUnitsByPatterns`

use glob::Pattern;

use crate::{errors::WatchError, systemd_client::UnitStatus};

/// Compiled state and name globs.
///
/// A unit matches when any state glob matches its active or sub state and any
/// name glob matches its name.
#[derive(Debug, Clone)]
pub struct UnitPatternMatcher {
    states: Vec<Pattern>,
    names: Vec<Pattern>,
}

impl UnitPatternMatcher {
    pub fn new(states: &[&str], names: &[&str]) -> Result<Self, WatchError> {
        Ok(Self {
            states: compile(states)?,
            names: compile(names)?,
        })
    }

    pub fn matches(&self, unit: &UnitStatus) -> bool {
        let state_matched = self.states.iter().any(|pattern| {
            pattern.matches(&unit.active_state) || pattern.matches(&unit.sub_state)
        });
        state_matched && self.names.iter().any(|pattern| pattern.matches(&unit.name))
    }

    pub fn filter(&self, units: Vec<UnitStatus>) -> Vec<UnitStatus> {
        units.into_iter().filter(|unit| self.matches(unit)).collect()
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Pattern>, WatchError> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|err| WatchError::InvalidPattern {
                pattern: (*pattern).to_string(),
                message: err.to_string(),
            })
        })
        .collect()
}
