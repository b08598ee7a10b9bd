use anyhow::{anyhow, Context, Result};
use kestrel_live::config::LiveConfig;
use kestrel_live::level::{load, serialize, LevelDocument, SCRIPTS_FIELD};
use kestrel_live::{engine_unit, EditorHost, LevelHost, Loader, ScriptDirectory, ENGINE_UNIT};
use serde_json::Value as JsonValue;
use std::env;
use std::path::Path;
use std::process;

const CONFIG_PATH: &str = "config/live.json";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run() {
        eprintln!("error: {err:?}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    match command.as_str() {
        "validate" => {
            let level_path = args
                .next()
                .ok_or_else(|| anyhow!("validate requires a path: level_tool validate <level>"))?;
            cmd_validate(&level_path)
        }
        "list" => {
            let level_path =
                args.next().ok_or_else(|| anyhow!("list requires a path: level_tool list <level>"))?;
            cmd_list(&level_path)
        }
        "load" => {
            let level_path = args
                .next()
                .ok_or_else(|| anyhow!("load requires a path: level_tool load <level> [--script-root <dir>]"))?;
            let script_root = match args.next().as_deref() {
                None => "scripts".to_string(),
                Some("--script-root") => args.next().ok_or_else(|| anyhow!("--script-root requires a directory"))?,
                Some(other) => return Err(anyhow!("unexpected argument '{other}'")),
            };
            cmd_load(&level_path, &script_root)
        }
        "resave" => {
            let input = args
                .next()
                .ok_or_else(|| anyhow!("resave requires input path: level_tool resave <in> <out> [script_root]"))?;
            let output = args
                .next()
                .ok_or_else(|| anyhow!("resave requires output path: level_tool resave <in> <out> [script_root]"))?;
            let script_root = args.next().unwrap_or_else(|| "scripts".to_string());
            cmd_resave(&input, &output, &script_root)
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => Err(anyhow!("unknown command '{other}'")),
    }
}

fn print_usage() {
    eprintln!(
        "Level Tool

Usage:
  level_tool validate <level>                      Check record tags, ids and entity references
  level_tool list <level>                          List entities, their classes and attached scripts
  level_tool load <level> [--script-root <dir>]    Build the level against script units and report counts
  level_tool resave <in> <out> [script_root]       Load a level and save it again through the live classes
  level_tool help                                  Show this message
"
    );
}

fn cmd_validate(level_path: &str) -> Result<()> {
    let document = read_document(level_path)?;
    let problems = document.validate();
    if problems.is_empty() {
        println!(
            "Level '{}' is valid. Entities: {}  Script classes: {}  Entity classes: {}",
            level_path,
            document.entities.len(),
            document.scripts.len(),
            document.entity_classes.len(),
        );
        Ok(())
    } else {
        Err(anyhow!("level '{}' has issues:\n  - {}", level_path, problems.join("\n  - ")))
    }
}

fn cmd_list(level_path: &str) -> Result<()> {
    let document = read_document(level_path)?;
    println!("{:<5} {:<24} {:<32} {}", "Idx", "Entity ID", "Class", "Scripts");
    println!("{}", "-".repeat(96));
    for (index, (id, record)) in document.entities.iter().enumerate() {
        let class = format!("{}:{}", text(record, "class_unit"), text(record, "class_name"));
        let scripts = match record.get(SCRIPTS_FIELD) {
            Some(JsonValue::Array(items)) if !items.is_empty() => {
                items.iter().map(|item| text(item, "class_name")).collect::<Vec<_>>().join(", ")
            }
            _ => "-".to_string(),
        };
        println!("{:<5} {:<24} {:<32} {}", index, id, class, scripts);
    }
    Ok(())
}

fn cmd_load(level_path: &str, script_root: &str) -> Result<()> {
    let document = read_document(level_path)?;
    let (mut loader, mut host) = live_session(script_root)?;
    let report = load(&document, &mut loader, &mut host)
        .with_context(|| format!("building level '{level_path}' from '{script_root}'"))?;
    println!(
        "Loaded '{}': {} entities ({} overlay), {} scripts, {} classes across units [{}]",
        level_path,
        report.entities,
        host.overlay_entities().len(),
        report.scripts,
        report.classes,
        loader.tracked_units().join(", "),
    );
    Ok(())
}

fn cmd_resave(input_path: &str, output_path: &str, script_root: &str) -> Result<()> {
    let document = read_document(input_path)?;
    let (mut loader, mut host) = live_session(script_root)?;
    load(&document, &mut loader, &mut host).with_context(|| format!("building level '{input_path}'"))?;
    let resaved = serialize(&host.persistent_entities(), host.assets())?;
    let pretty = LiveConfig::load_or_default(CONFIG_PATH).level.pretty;
    resaved.save_to_path(output_path, pretty)?;
    println!("Resaved '{}' -> '{}' ({} entities)", input_path, output_path, resaved.entities.len());
    Ok(())
}

fn live_session(script_root: &str) -> Result<(Loader, EditorHost)> {
    let mut loader = Loader::new(ScriptDirectory::new(script_root));
    loader.register_native_unit(ENGINE_UNIT, engine_unit())?;
    Ok((loader, EditorHost::new()))
}

fn text<'a>(record: &'a JsonValue, key: &str) -> &'a str {
    record.get(key).and_then(JsonValue::as_str).unwrap_or("?")
}

fn read_document(path: &str) -> Result<LevelDocument> {
    let normalized = Path::new(path).canonicalize().unwrap_or_else(|_| Path::new(path).to_path_buf());
    LevelDocument::load_from_path(&normalized).with_context(|| format!("loading level '{}'", normalized.display()))
}
