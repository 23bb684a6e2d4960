use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// The counters module must stay a leaf: no I/O, no addresses, no logging.
const OBSERVABILITY_FORBIDDEN: &[&str] = &[
    "std::net",
    "SocketAddr",
    "IpAddr",
    "std::fs",
    "std::process",
    "Instant",
    "SystemTime",
    "tokio",
    "tracing",
    "println!(",
    "eprintln!(",
    "hostname",
    "password",
];

fn main() {
    let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let obs_dir = Path::new(&manifest_dir)
        .join("src")
        .join("core")
        .join("observability");
    println!("cargo:rerun-if-changed={}", obs_dir.display());

    let mut files = Vec::new();
    collect_rs_files(&obs_dir, &mut files);
    for path in files {
        let contents = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
        if let Some(token) = OBSERVABILITY_FORBIDDEN
            .iter()
            .find(|token| contents.contains(*token))
        {
            panic!(
                "Forbidden token `{}` in observability module: {}",
                token,
                path.display()
            );
        }
    }
}

fn collect_rs_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rs_files(&path, files);
        } else if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            files.push(path);
        }
    }
}
