//! Plugin host: named plugins observing the buildroot lifecycle.
//!
//! Plugins are compiled in and selected by name at configuration time; a
//! name is considered only when `plugin_conf["<name>_enable"]` is set. Each
//! plugin advertises the hook API version it was built against — a plugin
//! that advertises none, or a different one, fails controller construction.
//!
//! Plugins never see the controller itself. They get a [`PluginContext`]:
//! the hook-registration capability plus their own option map, augmented
//! with the buildroot's `basedir`, `cache_topdir`, `cachedir`, and `root`
//! name.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::config::BuildrootConfig;
use crate::error::{BuildrootError, Result};
use crate::hooks::{Hook, HookRegistry, Stage};

/// Hook API version the host supports. Plugins advertising anything else
/// are rejected at construction.
pub const PLUGIN_API_VERSION: &str = "1.0";

/// Narrow capability object handed to [`Plugin::init`].
pub struct PluginContext<'a> {
    hooks: &'a mut HookRegistry,
    /// Plugin options from the configuration, augmented with `basedir`,
    /// `cache_topdir`, `cachedir`, and `root`.
    pub opts: Map<String, Value>,
}

impl PluginContext<'_> {
    /// Subscribe a callback to a lifecycle stage. Duplicate keys per stage
    /// register once.
    pub fn add_hook(&mut self, stage: Stage, key: impl Into<String>, hook: Hook) {
        self.hooks.add(stage, key, hook);
    }
}

/// A compiled-in lifecycle observer.
pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Hook API version this plugin was built against. `None` means the
    /// plugin does not advertise one, which is fatal.
    fn api_version(&self) -> Option<&'static str>;

    fn init(&mut self, ctx: &mut PluginContext<'_>) -> Result<()>;
}

type PluginFactory = Box<dyn Fn() -> Box<dyn Plugin>>;

/// Name-indexed set of available plugins.
pub struct PluginRegistry {
    factories: BTreeMap<&'static str, PluginFactory>,
}

impl PluginRegistry {
    /// Registry of the plugins shipped with the crate.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("tracepoints", || Box::new(Tracepoints));
        registry
    }

    /// Make `factory`'s plugin available under `name`. Later registrations
    /// shadow earlier ones.
    pub fn register<F>(&mut self, name: &'static str, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + 'static,
    {
        self.factories.insert(name, Box::new(factory));
    }

    fn construct(&self, name: &str) -> Option<Box<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory())
    }
}

/// Instantiate and initialize every enabled plugin, wiring hook
/// registrations into `hooks`.
pub fn init_plugins(
    config: &BuildrootConfig,
    registry: &PluginRegistry,
    hooks: &mut HookRegistry,
) -> Result<()> {
    let cachedir = config.cache_topdir.join(config.shared_root_name());
    let basedir = config.basedir.join(config.shared_root_name());

    for name in &config.plugins {
        let enabled = config
            .plugin_conf
            .get(&format!("{name}_enable"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !enabled {
            tracing::debug!(plugin = %name, "plugin not enabled; skipped");
            continue;
        }

        let Some(mut plugin) = registry.construct(name) else {
            return Err(BuildrootError::Plugin(format!(
                "unknown plugin {name:?} (plugin_dir {})",
                config.plugin_dir.display()
            )));
        };

        match plugin.api_version() {
            None => {
                return Err(BuildrootError::Plugin(format!(
                    "plugin {name:?} does not specify a required API version"
                )));
            }
            Some(version) if version != PLUGIN_API_VERSION => {
                return Err(BuildrootError::Plugin(format!(
                    "plugin {name:?} requires API version {version}, host provides {PLUGIN_API_VERSION}"
                )));
            }
            Some(_) => {}
        }

        let mut opts = config
            .plugin_conf
            .get(&format!("{name}_opts"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        opts.insert(
            "basedir".into(),
            Value::String(basedir.to_string_lossy().into_owned()),
        );
        opts.insert(
            "cache_topdir".into(),
            Value::String(config.cache_topdir.to_string_lossy().into_owned()),
        );
        opts.insert(
            "cachedir".into(),
            Value::String(cachedir.to_string_lossy().into_owned()),
        );
        opts.insert("root".into(), Value::String(config.shared_root_name()));

        let mut ctx = PluginContext {
            hooks: &mut *hooks,
            opts,
        };
        plugin.init(&mut ctx)?;
        tracing::debug!(plugin = %name, "plugin initialized");
    }
    Ok(())
}

/// Built-in plugin that logs every lifecycle stage as it fires.
struct Tracepoints;

impl Plugin for Tracepoints {
    fn name(&self) -> &'static str {
        "tracepoints"
    }

    fn api_version(&self) -> Option<&'static str> {
        Some(PLUGIN_API_VERSION)
    }

    fn init(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
        for stage in Stage::ALL {
            let stage = *stage;
            ctx.add_hook(
                stage,
                format!("tracepoints:{stage}"),
                Box::new(move || {
                    tracing::info!(stage = %stage, "lifecycle stage");
                    Ok(())
                }),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use std::cell::Cell;
    use std::path::Path;
    use std::rc::Rc;

    struct Versionless;

    impl Plugin for Versionless {
        fn name(&self) -> &'static str {
            "versionless"
        }
        fn api_version(&self) -> Option<&'static str> {
            None
        }
        fn init(&mut self, _ctx: &mut PluginContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn enabled(config: &mut BuildrootConfig, name: &str) {
        config
            .plugin_conf
            .insert(format!("{name}_enable"), Value::Bool(true));
        config.plugins.push(name.to_string());
    }

    #[test]
    fn missing_api_version_is_fatal_and_names_plugin() {
        let mut config = test_config(Path::new("/tmp/buildroots"));
        enabled(&mut config, "versionless");

        let mut registry = PluginRegistry::builtin();
        registry.register("versionless", || Box::new(Versionless));

        let mut hooks = HookRegistry::new();
        let err = init_plugins(&config, &registry, &mut hooks).unwrap_err();
        assert!(matches!(err, BuildrootError::Plugin(_)));
        assert!(err.to_string().contains("versionless"));
    }

    #[test]
    fn unknown_plugin_is_fatal() {
        let mut config = test_config(Path::new("/tmp/buildroots"));
        enabled(&mut config, "who-dis");

        let registry = PluginRegistry::builtin();
        let mut hooks = HookRegistry::new();
        let err = init_plugins(&config, &registry, &mut hooks).unwrap_err();
        assert!(err.to_string().contains("who-dis"));
    }

    #[test]
    fn disabled_plugin_is_skipped() {
        let mut config = test_config(Path::new("/tmp/buildroots"));
        config.plugins.push("versionless".into());
        // no versionless_enable key

        let mut registry = PluginRegistry::builtin();
        registry.register("versionless", || Box::new(Versionless));

        let mut hooks = HookRegistry::new();
        init_plugins(&config, &registry, &mut hooks).unwrap();
    }

    #[test]
    fn opts_are_augmented_with_buildroot_paths() {
        struct Probe {
            seen: Rc<std::cell::RefCell<Map<String, Value>>>,
        }
        impl Plugin for Probe {
            fn name(&self) -> &'static str {
                "probe"
            }
            fn api_version(&self) -> Option<&'static str> {
                Some(PLUGIN_API_VERSION)
            }
            fn init(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
                *self.seen.borrow_mut() = ctx.opts.clone();
                Ok(())
            }
        }

        let mut config = test_config(Path::new("/tmp/buildroots"));
        enabled(&mut config, "probe");
        config
            .plugin_conf
            .insert("probe_opts".into(), serde_json::json!({"keep": "me"}));

        let seen = Rc::new(std::cell::RefCell::new(Map::new()));
        let mut registry = PluginRegistry::builtin();
        {
            let seen = seen.clone();
            registry.register("probe", move || Box::new(Probe { seen: seen.clone() }));
        }

        let mut hooks = HookRegistry::new();
        init_plugins(&config, &registry, &mut hooks).unwrap();

        let opts = seen.borrow();
        assert_eq!(opts.get("keep"), Some(&Value::String("me".into())));
        assert_eq!(
            opts.get("root"),
            Some(&Value::String("fedora-x86_64".into()))
        );
        assert_eq!(
            opts.get("basedir"),
            Some(&Value::String("/tmp/buildroots/fedora-x86_64".into()))
        );
        assert!(opts.contains_key("cachedir"));
        assert!(opts.contains_key("cache_topdir"));
    }

    #[test]
    fn tracepoints_registers_every_stage() {
        let mut config = test_config(Path::new("/tmp/buildroots"));
        enabled(&mut config, "tracepoints");

        let registry = PluginRegistry::builtin();
        let mut hooks = HookRegistry::new();
        init_plugins(&config, &registry, &mut hooks).unwrap();

        for stage in Stage::ALL {
            assert_eq!(hooks.count(*stage), 1, "stage {stage}");
        }
        hooks.fire(Stage::PreInit).unwrap();
    }

    #[test]
    fn duplicate_hook_keys_collapse() {
        let mut hooks = HookRegistry::new();
        let fired = Rc::new(Cell::new(0));
        let mut ctx = PluginContext {
            hooks: &mut hooks,
            opts: Map::new(),
        };
        for _ in 0..2 {
            let fired = fired.clone();
            ctx.add_hook(
                Stage::PostYum,
                "same-key",
                Box::new(move || {
                    fired.set(fired.get() + 1);
                    Ok(())
                }),
            );
        }
        hooks.fire(Stage::PostYum).unwrap();
        assert_eq!(fired.get(), 1);
    }
}
