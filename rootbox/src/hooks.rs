//! Lifecycle stages and the hook registry.
//!
//! Hooks are callables registered against a named stage; within a stage
//! they fire in registration order and an error from any hook aborts the
//! stage. Registration is set-like per stage: a hook registers under a key,
//! and a duplicate key is ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{BuildrootError, Result};

/// Named lifecycle points at which hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    PreInit,
    PostInit,
    EarlyPrebuild,
    Prebuild,
    Postbuild,
    PreYum,
    PostYum,
}

impl Stage {
    pub const ALL: &'static [Stage] = &[
        Stage::PreInit,
        Stage::PostInit,
        Stage::EarlyPrebuild,
        Stage::Prebuild,
        Stage::Postbuild,
        Stage::PreYum,
        Stage::PostYum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PreInit => "preinit",
            Stage::PostInit => "postinit",
            Stage::EarlyPrebuild => "earlyprebuild",
            Stage::Prebuild => "prebuild",
            Stage::Postbuild => "postbuild",
            Stage::PreYum => "preyum",
            Stage::PostYum => "postyum",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = BuildrootError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| BuildrootError::Plugin(format!("unknown hook stage {s:?}")))
    }
}

/// A registered hook callback.
pub type Hook = Box<dyn FnMut() -> Result<()>>;

/// Stage-indexed hook registry.
#[derive(Default)]
pub struct HookRegistry {
    hooks: BTreeMap<Stage, Vec<(String, Hook)>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` under `key` for `stage`. A key already present for
    /// the stage leaves the existing registration in place.
    pub fn add(&mut self, stage: Stage, key: impl Into<String>, hook: Hook) {
        let key = key.into();
        let entries = self.hooks.entry(stage).or_default();
        if entries.iter().any(|(existing, _)| *existing == key) {
            tracing::debug!(stage = %stage, key = %key, "duplicate hook registration ignored");
            return;
        }
        entries.push((key, hook));
    }

    /// Fire every hook of `stage` in registration order; the first error
    /// aborts the stage.
    pub fn fire(&mut self, stage: Stage) -> Result<()> {
        let Some(entries) = self.hooks.get_mut(&stage) else {
            return Ok(());
        };
        for (key, hook) in entries.iter_mut() {
            tracing::trace!(stage = %stage, key = %key, "firing hook");
            hook()?;
        }
        Ok(())
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.hooks.get(&stage).map_or(0, Vec::len)
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (stage, entries) in &self.hooks {
            let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
            map.entry(stage, &keys);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()).unwrap(), *stage);
        }
        assert!(Stage::from_str("midbuild").is_err());
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut registry = HookRegistry::new();
        for name in ["first", "second", "third"] {
            let order = order.clone();
            registry.add(
                Stage::PreInit,
                name,
                Box::new(move || {
                    order.borrow_mut().push(name);
                    Ok(())
                }),
            );
        }
        registry.fire(Stage::PreInit).unwrap();
        assert_eq!(*order.borrow(), ["first", "second", "third"]);
    }

    #[test]
    fn duplicate_key_registers_once() {
        let count = Rc::new(Cell::new(0));
        let mut registry = HookRegistry::new();
        for _ in 0..2 {
            let count = count.clone();
            registry.add(
                Stage::PreYum,
                "cache-check",
                Box::new(move || {
                    count.set(count.get() + 1);
                    Ok(())
                }),
            );
        }
        assert_eq!(registry.count(Stage::PreYum), 1);
        registry.fire(Stage::PreYum).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn error_aborts_stage() {
        let reached = Rc::new(Cell::new(false));
        let mut registry = HookRegistry::new();
        registry.add(
            Stage::Prebuild,
            "boom",
            Box::new(|| Err(BuildrootError::Build("hook refused".into()))),
        );
        {
            let reached = reached.clone();
            registry.add(
                Stage::Prebuild,
                "after",
                Box::new(move || {
                    reached.set(true);
                    Ok(())
                }),
            );
        }
        assert!(registry.fire(Stage::Prebuild).is_err());
        assert!(!reached.get(), "hook after the failing one must not fire");
    }

    #[test]
    fn firing_an_empty_stage_is_ok() {
        let mut registry = HookRegistry::new();
        registry.fire(Stage::Postbuild).unwrap();
    }
}
