use class_proxy::backend::{InstanceRef, RemapBackend};
use class_proxy::builder::ClassFileBuilder;
use class_proxy::classfile::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC};
use class_proxy::classpath::{ClassSource, Classpath};
use class_proxy::criterion::{Category, Criterion, MatchKind};
use class_proxy::dispatch::HandlerRegistry;
use class_proxy::generator::{Contract, DEFAULT_BINDING, ProxyClassGenerator};
use class_proxy::index::IndexBuilder;
use class_proxy::instance::{Instance, ProxyArg, ProxyInstanceCache};
use class_proxy::registry::{ClasspathLoader, Registry};
use class_proxy::version::{MappingTable, VersionToken};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(name: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "class_proxy_it_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

fn write_jar(path: &std::path::Path, entries: &[(String, Vec<u8>)]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(name.as_str(), options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

fn entry(builder: ClassFileBuilder, name: &str) -> (String, Vec<u8>) {
    (format!("{}.class", name.replace('.', "/")), builder.build())
}

fn game_jar(base: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
    let jar = base.join("game.jar");
    write_jar(
        &jar,
        &[
            entry(
                ClassFileBuilder::new("game.Engine").access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT),
                "game.Engine",
            ),
            entry(ClassFileBuilder::new("game.EngineImpl").interface("game.Engine"), "game.EngineImpl"),
            entry(
                ClassFileBuilder::new("game.EngineImplV2")
                    .interface("game.Engine")
                    .method("world", "()Lhost/World;", &[]),
                "game.EngineImplV2",
            ),
            entry(
                ClassFileBuilder::new("game.EngineImplV2$Cache").reference("host.World"),
                "game.EngineImplV2$Cache",
            ),
            entry(ClassFileBuilder::new("game.Base"), "game.Base"),
            entry(ClassFileBuilder::new("game.Derived").super_class("game.Base"), "game.Derived"),
            entry(
                ClassFileBuilder::new("game.JoinListener")
                    .super_class("game.Base")
                    .method("onJoin", "()V", &["game.SubscribeEvent"]),
                "game.JoinListener",
            ),
            entry(
                ClassFileBuilder::new("game.QuitListener").method("onQuit", "()V", &["game.SubscribeEvent"]),
                "game.QuitListener",
            ),
            ("game/Broken.class".to_string(), b"not a class".to_vec()),
            ("META-INF/MANIFEST.MF".to_string(), b"Manifest-Version: 1.0\n".to_vec()),
        ],
    )?;
    Ok(jar)
}

fn criteria() -> IndexBuilder {
    IndexBuilder::new()
        .register_all([
            Criterion::new("handlers").subtype(["game.Base"]),
            Criterion::new("events").method_annotation(["game.SubscribeEvent"]),
        ])
        .expect("criterion names are distinct")
}

#[test]
fn index_registry_and_dispatch_over_a_jar() -> anyhow::Result<()> {
    let base = temp_dir("index_flow");
    let source: Arc<dyn ClassSource> = Arc::new(Classpath::open(&[game_jar(&base)?])?);

    let report = criteria().build(source.as_ref());
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].class_name, "game.Broken");

    let index = report.into_shared();
    let handlers = index.get(&Category::new("handlers", MatchKind::Subtype));
    assert!(handlers.contains("game.Derived") && handlers.contains("game.JoinListener"));
    // Both criteria see JoinListener; each records it in its own scope.
    let events = index.get(&Category::new("events", MatchKind::MethodAnnotation));
    assert!(events.contains("game.JoinListener") && events.contains("game.QuitListener"));

    let registry = Registry::new(Arc::clone(&index), Arc::new(ClasspathLoader::new(Arc::clone(&source))));
    let seen = Arc::new(AtomicUsize::new(0));
    let mut dispatch = HandlerRegistry::new();
    let counter = Arc::clone(&seen);
    dispatch.register(Category::new("events", MatchKind::MethodAnnotation), move |class| {
        assert!(class.descriptor.methods.iter().any(|m| !m.annotations.is_empty()));
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let summary = dispatch.dispatch(&registry);
    assert_eq!(summary.invoked, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    let _ = std::fs::remove_dir_all(base);
    Ok(())
}

#[test]
fn concurrent_resolution_synthesizes_once() -> anyhow::Result<()> {
    let base = temp_dir("concurrent_resolve");
    let source: Arc<dyn ClassSource> = Arc::new(Classpath::open(&[game_jar(&base)?])?);
    let index = criteria().build(source.as_ref()).into_shared();

    let resolver = MappingTable::new(VersionToken::parse("V2").unwrap())
        .map("game.EngineImpl", "game.EngineImplV2")
        .map("host.World", "host.v2.World");
    let backend = Arc::new(RemapBackend::new());
    let generator = Arc::new(ProxyClassGenerator::new(
        source,
        index,
        Arc::new(resolver),
        backend.clone(),
    ));

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let generator = Arc::clone(&generator);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                generator.resolve(&Contract::new("game.Engine"), DEFAULT_BINDING)
            })
        })
        .collect();
    let classes = handles
        .into_iter()
        .map(|h| h.join().expect("resolver thread panicked"))
        .collect::<Result<Vec<_>, _>>()?;

    assert!(classes.iter().all(|c| Arc::ptr_eq(c, &classes[0])));
    assert_eq!(classes[0].name(), "game.EngineImplV2");
    assert_eq!(classes[0].nested_names(), vec!["game.EngineImplV2$Cache".to_string()]);
    assert_eq!(generator.synthesized_count(), 1);
    // One outer class and one nested class, compiled once.
    assert_eq!(backend.defined_count(), 2);

    let _ = std::fs::remove_dir_all(base);
    Ok(())
}

#[test]
fn concurrent_instantiation_constructs_once() -> anyhow::Result<()> {
    let base = temp_dir("concurrent_instance");
    let source: Arc<dyn ClassSource> = Arc::new(Classpath::open(&[game_jar(&base)?])?);
    let index = criteria().build(source.as_ref()).into_shared();

    let constructed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&constructed);
    let backend = RemapBackend::new().constructor(
        "game.EngineImpl",
        &[std::any::type_name::<String>()],
        move |class, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            let label = format!("{}({})", class.name(), args[0].get::<String>().cloned().unwrap_or_default());
            Ok(Arc::new(label) as InstanceRef)
        },
    );
    let resolver = MappingTable::new(VersionToken::parse("V1").unwrap());
    let generator = ProxyClassGenerator::new(source, index, Arc::new(resolver), Arc::new(backend));
    let cache = Arc::new(ProxyInstanceCache::new(Arc::new(generator)));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                cache.instantiate(
                    &Contract::new("game.Engine"),
                    DEFAULT_BINDING,
                    &[ProxyArg::new("server".to_string())],
                )
            })
        })
        .collect();
    let instances = handles
        .into_iter()
        .map(|h| h.join().expect("instantiating thread panicked"))
        .collect::<Result<Vec<_>, _>>()?;

    assert!(instances.iter().all(|i| Instance::ptr_eq(i, &instances[0])));
    assert_eq!(constructed.load(Ordering::SeqCst), 1);
    assert_eq!(
        instances[0].downcast::<String>().as_deref().map(String::as_str),
        Some("game.EngineImpl(server)")
    );

    let _ = std::fs::remove_dir_all(base);
    Ok(())
}
