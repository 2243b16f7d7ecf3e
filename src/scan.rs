use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Files found under a classpath directory root.
#[derive(Debug, Default)]
pub struct RootListing {
    pub class_files: Vec<PathBuf>,
    pub jars: Vec<PathBuf>,
}

pub fn scan_root(base_path: &Path) -> Result<RootListing> {
    if !base_path.is_dir() {
        anyhow::bail!("classpath root is not a directory: {}", base_path.display());
    }

    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if let Some(ext) = path.extension().and_then(|e| e.to_str())
                    && (ext == "class" || ext == "jar")
                {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut listing = RootListing::default();
    for path in rx.iter() {
        if path.extension().is_some_and(|e| e == "jar") {
            listing.jars.push(path);
        } else {
            listing.class_files.push(path);
        }
    }
    // The walk is parallel; sort so that duplicate resolution is stable.
    listing.class_files.sort();
    listing.jars.sort();
    Ok(listing)
}

pub fn class_name_to_class_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// `org/a/B$C.class` -> `org.a.B$C`. Returns `None` for non-class entries and
/// for `module-info`/`package-info`, which are not types.
pub fn class_path_to_class_name(entry: &str) -> Option<String> {
    let stem = entry.strip_suffix(".class")?;
    if stem.starts_with("META-INF/") {
        return None;
    }
    let name = stem.replace(['/', '\\'], ".");
    if name.ends_with("module-info") || name.ends_with("package-info") {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn scan_root_separates_classes_and_jars() {
        let base = temp_dir("class-proxy-scan");
        fs::create_dir_all(base.join("org/example")).unwrap();
        fs::create_dir_all(base.join("libs")).unwrap();
        fs::write(base.join("org/example/A.class"), b"x").unwrap();
        fs::write(base.join("org/example/B.class"), b"x").unwrap();
        fs::write(base.join("org/example/readme.txt"), b"x").unwrap();
        fs::write(base.join("libs/dep.jar"), b"x").unwrap();

        let listing = scan_root(&base).unwrap();
        assert_eq!(listing.class_files.len(), 2);
        assert!(listing.class_files[0].ends_with("org/example/A.class"));
        assert_eq!(listing.jars, vec![base.join("libs/dep.jar")]);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn class_path_conversion_skips_metadata() {
        assert_eq!(
            class_path_to_class_name("org/a/B$C.class").as_deref(),
            Some("org.a.B$C")
        );
        assert_eq!(class_path_to_class_name("module-info.class"), None);
        assert_eq!(class_path_to_class_name("org/a/package-info.class"), None);
        assert_eq!(
            class_path_to_class_name("META-INF/versions/9/org/a/B.class"),
            None
        );
        assert_eq!(class_path_to_class_name("org/a/B.txt"), None);
        assert_eq!(class_name_to_class_path("org.a.B$C"), "org/a/B$C.class");
    }
}
