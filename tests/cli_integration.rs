use class_proxy::builder::ClassFileBuilder;
use class_proxy::classfile::read_class;
use serde_json::Value;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(name: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "class_proxy_cli_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

fn write_file(path: &std::path::Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn write_jar(path: &std::path::Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

fn run(bin: &str, args: &[&str]) -> anyhow::Result<std::process::Output> {
    Ok(Command::new(bin).args(args).env_remove("CLASS_PROXY_STORE").output()?)
}

fn run_json(bin: &str, args: &[&str]) -> anyhow::Result<Value> {
    let out = run(bin, args)?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "command failed: status={:?}, stderr={}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

const CONFIG: &str = r#"
[[criteria]]
name = "handlers"
subtype = ["game.Base"]

[[criteria]]
name = "events"
method_annotation = ["game.SubscribeEvent"]

[version]
current = "V1"

[[version.mappings]]
since = "V2"
names = { "game.EngineImpl" = "game.EngineImplV2", "host.World" = "host.v2.World" }
"#;

#[test]
fn index_query_resolve_and_store_flow() -> anyhow::Result<()> {
    let bin = env!("CARGO_BIN_EXE_class-proxy");
    let base = temp_dir("flow");
    let store = base.join("store").join("index.lmdb");
    let config = base.join("proxy.toml");
    write_file(&config, CONFIG)?;

    let engine = ClassFileBuilder::new("game.Engine").build();
    let v1 = ClassFileBuilder::new("game.EngineImpl").interface("game.Engine").build();
    let v2 = ClassFileBuilder::new("game.EngineImplV2")
        .interface("game.Engine")
        .method("world", "()Lhost/World;", &[])
        .build();
    let v2_inner = ClassFileBuilder::new("game.EngineImplV2$Cache").build();
    let base_class = ClassFileBuilder::new("game.Base").build();
    let derived = ClassFileBuilder::new("game.Derived").super_class("game.Base").build();
    let listener = ClassFileBuilder::new("game.Listener")
        .method("onJoin", "()V", &["game.SubscribeEvent"])
        .build();
    let jar = base.join("game.jar");
    write_jar(
        &jar,
        &[
            ("game/Engine.class", engine.as_slice()),
            ("game/EngineImpl.class", v1.as_slice()),
            ("game/EngineImplV2.class", v2.as_slice()),
            ("game/EngineImplV2$Cache.class", v2_inner.as_slice()),
            ("game/Base.class", base_class.as_slice()),
            ("game/Derived.class", derived.as_slice()),
            ("game/Listener.class", listener.as_slice()),
            ("game/Broken.class", &b"junk"[..]),
        ],
    )?;

    let jar_arg = jar.to_string_lossy().to_string();
    let store_arg = store.to_string_lossy().to_string();
    let config_arg = config.to_string_lossy().to_string();
    let global = [
        "--config",
        config_arg.as_str(),
        "--store",
        store_arg.as_str(),
        "-c",
        jar_arg.as_str(),
    ];
    let with = |args: &[&str]| -> Vec<String> {
        args.iter()
            .chain(global.iter())
            .map(|s| s.to_string())
            .collect()
    };
    let call = |args: &[&str]| -> anyhow::Result<Value> {
        let owned = with(args);
        let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
        run_json(bin, &refs)
    };

    let first = call(&["index"])?;
    assert_eq!(first["cache_hit"], false);
    assert_eq!(first["classes"], 7);
    assert_eq!(first["categories"]["@handlers:subtype"], 1);
    assert_eq!(first["categories"]["@events:method-annotation"], 1);
    assert_eq!(first["warnings"].as_array().map(Vec::len), Some(1));
    assert_eq!(first["warnings"][0]["class_name"], "game.Broken");

    let second = call(&["index"])?;
    assert_eq!(second["cache_hit"], true);
    assert_eq!(second["fingerprint"], first["fingerprint"]);
    assert_eq!(second["warnings"], first["warnings"]);

    let events = call(&["query", "@events:method-annotation"])?;
    assert_eq!(events, serde_json::json!(["game.Listener"]));
    let empty = call(&["query", "@nobody:subtype"])?;
    assert_eq!(empty, serde_json::json!([]));

    let literal = call(&["resolve", "game.Engine"])?;
    assert_eq!(literal["version"], "V1");
    assert_eq!(literal["class_name"], "game.EngineImpl");

    let out_class = base.join("out").join("EngineImplV2.class");
    let out_arg = out_class.to_string_lossy().to_string();
    let mapped = call(&["resolve", "game.Engine", "--version", "V2", "-o", out_arg.as_str()])?;
    assert_eq!(mapped["logical_name"], "game.EngineImpl");
    assert_eq!(mapped["class_name"], "game.EngineImplV2");
    assert_eq!(mapped["nested"], serde_json::json!(["game.EngineImplV2$Cache"]));
    assert_eq!(mapped["relocations"]["host/World"], "host/v2/World");
    let written = read_class(&std::fs::read(&out_class)?)?;
    assert_eq!(written.methods[0].descriptor, "()Lhost/v2/World;");

    let stats = run_json(bin, &["stats", "--store", store_arg.as_str()])?;
    assert_eq!(stats["stored_indices"], 1);
    assert_eq!(stats["latest_classes"], 7);

    let missing = run(bin, &with(&["resolve", "game.Gearbox"]).iter().map(String::as_str).collect::<Vec<_>>())?;
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("game.GearboxImpl"));

    run_json(bin, &["clear", "--store", store_arg.as_str()])?;
    assert!(!store.exists());

    let _ = std::fs::remove_dir_all(base);
    Ok(())
}

#[test]
fn missing_classpath_is_reported() -> anyhow::Result<()> {
    let bin = env!("CARGO_BIN_EXE_class-proxy");
    let out = run(bin, &["index", "--no-store"])?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("classpath"));
    Ok(())
}
