use std::path::{Path, PathBuf};

fn collect_class_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_class_files(&path, out)?;
        } else if path.extension().is_some_and(|e| e == "class") {
            out.push(path);
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let dir = args.next().unwrap_or_else(|| {
        eprintln!("Usage: lucent <class-dir> [pass-id...]");
        std::process::exit(1);
    });
    let selection: Vec<String> = args.collect();

    let mut files = Vec::new();
    if let Err(err) = collect_class_files(Path::new(&dir), &mut files) {
        eprintln!("Could not read {}: {}", dir, err);
        std::process::exit(1);
    }

    let mut classes = Vec::with_capacity(files.len());
    for path in files {
        match std::fs::read(&path) {
            Ok(bytes) => classes.push((path.display().to_string(), bytes)),
            Err(err) => eprintln!("Skipping {}: {}", path.display(), err),
        }
    }

    let (mut universe, failed) = lucent::load_universe(classes);
    for (entry, error) in &failed {
        eprintln!("{}: {}", entry, error);
    }
    println!(
        "{} classes loaded, {} failed to parse",
        universe.len(),
        failed.len()
    );

    let selection: Vec<&str> = if selection.is_empty() {
        lucent::list_passes().iter().map(|info| info.id).collect()
    } else {
        selection.iter().map(String::as_str).collect()
    };

    let summary = lucent::run_pipeline(
        &mut universe,
        &selection,
        log::log_enabled!(log::Level::Debug),
        lucent::CancelToken::new(),
    );
    for outcome in &summary.outcomes {
        println!(
            "{}: {}{}",
            outcome.id,
            if outcome.changed { "changed" } else { "no change" },
            outcome
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
    for (class, failure) in universe.failures() {
        println!("{}: {}", class, failure);
    }
}
