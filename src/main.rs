use anyhow::{Context, Result};
use kestrel_live::cli::CliOverrides;
use kestrel_live::config::LiveConfig;
use kestrel_live::level::load_level;
use kestrel_live::watch::UnitWatcher;
use kestrel_live::{engine_unit, EditorHost, Loader, ScriptDirectory, ENGINE_UNIT};
use log::{error, info, warn};
use std::thread;

const CONFIG_PATH: &str = "config/live.json";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli_overrides = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed.into_config_overrides(),
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    let mut config = LiveConfig::load_or_default(CONFIG_PATH);
    if !cli_overrides.is_empty() {
        info!("[config] command line overrides: {}", cli_overrides.applied_fields().join(", "));
        config.apply_overrides(&cli_overrides);
    }
    if let Err(err) = run(&config) {
        error!("Live session error: {err:?}");
        std::process::exit(1);
    }
}

/// Loads the configured level, then reloads code whenever a unit under the script root changes.
fn run(config: &LiveConfig) -> Result<()> {
    let source = ScriptDirectory::with_extension(&config.units.script_root, &config.units.extension);
    let mut loader = Loader::new(source);
    loader.register_native_unit(ENGINE_UNIT, engine_unit())?;
    loader.set_make_everything_reloadable(config.reload.everything_reloadable);
    loader.set_force_reload_on_first_load(config.reload.force_reload_on_first_load);

    let mut host = EditorHost::new();
    let level = &config.level.save_path;
    if level.exists() {
        load_level(level, &mut loader, &mut host).with_context(|| format!("loading level {}", level.display()))?;
    } else {
        warn!("[level] {} does not exist yet, starting empty", level.display());
    }
    if !config.reload.watch {
        return Ok(());
    }

    let mut watcher =
        UnitWatcher::new(&config.units.script_root, &config.units.extension, config.reload.poll_interval())?;
    info!("[watch] watching {} for *.{}", watcher.root().display(), config.units.extension);
    loop {
        thread::sleep(config.reload.poll_interval());
        let changed = watcher.drain_changed_units();
        if changed.is_empty() {
            continue;
        }
        info!("[watch] changed units: {}", changed.join(", "));
        match loader.reload() {
            Ok(_) => {
                if let Err(err) = host.dispatch("on_reload", &[]) {
                    warn!("[reload] on_reload callback failed: {err}");
                }
            }
            Err(err) => warn!("[reload] {err}"),
        }
    }
}
