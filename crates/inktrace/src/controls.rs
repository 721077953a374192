//! Operator key bindings.

use std::collections::BTreeMap;

/// Something the operator can ask for while capturing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Stop the session.
    Quit,
    /// Retire the active trace now.
    ResetTrace,
}

/// Single-character key bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMap {
    bindings: BTreeMap<char, Action>,
}

impl Default for ControlMap {
    /// `q` quits, `r` resets the trace.
    fn default() -> Self {
        let mut map = Self::empty();
        map.bind('q', Action::Quit);
        map.bind('r', Action::ResetTrace);
        map
    }
}

impl ControlMap {
    pub fn empty() -> Self {
        Self {
            bindings: BTreeMap::new(),
        }
    }

    pub fn bind(&mut self, key: char, action: Action) {
        self.bindings.insert(key, action);
    }

    /// Action bound to `key`. Unbound keys are logged and ignored.
    pub fn action_for(&self, key: char) -> Option<Action> {
        let action = self.bindings.get(&key).copied();
        if action.is_none() {
            tracing::debug!("ignoring unbound key {:?}", key);
        }
        action
    }

    pub fn bindings(&self) -> impl Iterator<Item = (char, Action)> + '_ {
        self.bindings.iter().map(|(&k, &a)| (k, a))
    }
}
