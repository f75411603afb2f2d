use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use image::DynamicImage;

use prnu_forensics::{
    is_supported_image, load_image, AuthenticationResult, Config, FileStore, FingerprintStore,
    PrnuEngine, StoreKey, TamperDetectionResult,
};

#[derive(Parser)]
#[command(
    name = "prnu",
    about = "Authenticate images against enrolled camera sensor fingerprints",
    version,
    after_help = "Records are sealed with the key from --key or PRNU_STORE_KEY.\n\
                  Generate one with: prnu keygen"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file (defaults apply to omitted fields)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Fingerprint store directory
    #[arg(short, long, global = true, default_value = "prnu-store")]
    store: PathBuf,

    /// Hex store key
    #[arg(short, long, global = true, env = "PRNU_STORE_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Build and store a camera fingerprint from image files or directories
    Enroll {
        /// Camera identifier
        camera_id: String,
        /// Enrollment images or directories of images
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Check whether images were taken by an enrolled camera
    Authenticate {
        /// Camera identifier
        camera_id: String,
        /// Query images
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Localize regions that do not carry the camera's sensor pattern
    Tamper {
        /// Camera identifier
        camera_id: String,
        /// Query image
        image: PathBuf,
    },
    /// List enrolled cameras
    List,
    /// Remove a camera's fingerprint
    Delete {
        /// Camera identifier
        camera_id: String,
    },
    /// Print a new random store key
    Keygen,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        log::LevelFilter::Error
    } else if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Load the config and open the store, unlocked with the CLI key.
fn open_store(cli: &Cli) -> prnu_forensics::Result<(Config, Arc<FileStore>)> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let store = Arc::new(FileStore::open(&cli.store, config.secure_storage)?);
    if store.is_secure() {
        let hex = cli.key.as_deref().ok_or_else(|| {
            prnu_forensics::Error::InvalidConfig(
                "secure store needs --key or PRNU_STORE_KEY".into(),
            )
        })?;
        store.unlock(StoreKey::from_hex(hex)?);
    }
    Ok((config, store))
}

fn run(cli: &Cli) -> prnu_forensics::Result<()> {
    match &cli.command {
        Command::Enroll { camera_id, paths } => {
            let (config, store) = open_store(cli)?;
            let files = collect_images(paths)?;
            if !cli.quiet {
                eprintln!("Enrolling '{camera_id}' from {} images", files.len());
            }
            let images = load_all(&files)?;
            let engine = PrnuEngine::new(config, store)?;
            let fp = engine.enroll(camera_id.as_str(), images).wait()?;
            if cli.json {
                print_json(&serde_json::json!({
                    "camera_id": fp.camera_id(),
                    "width": fp.width(),
                    "height": fp.height(),
                    "number_of_images": fp.number_of_images(),
                    "average_pce": fp.average_pce(),
                    "enrollment_date": fp.enrollment_date(),
                    "version": fp.version(),
                }))?;
            } else if !cli.quiet {
                eprintln!(
                    "[OK] {} enrolled ({}x{}, {} images, average PCE {:.1})",
                    fp.camera_id(),
                    fp.width(),
                    fp.height(),
                    fp.number_of_images(),
                    fp.average_pce()
                );
            }
            Ok(())
        }
        Command::Authenticate { camera_id, images } => {
            let (config, store) = open_store(cli)?;
            let decoded = load_all(images)?;
            let engine = PrnuEngine::new(config, store)?;
            let results = if decoded.len() == 1 {
                let image = decoded.into_iter().next().ok_or_else(|| {
                    prnu_forensics::Error::ProcessingFailure("no image to authenticate".into())
                })?;
                vec![engine.authenticate(image, camera_id.as_str()).wait()?]
            } else {
                engine.authenticate_batch(decoded, camera_id.as_str()).wait()?
            };

            if cli.json {
                print_json(&results)?;
            } else {
                for (path, result) in images.iter().zip(&results) {
                    print_verdict(path, result, cli.quiet);
                }
            }
            if results.iter().all(|r| r.is_authentic) {
                Ok(())
            } else {
                process::exit(1);
            }
        }
        Command::Tamper { camera_id, image } => {
            let (config, store) = open_store(cli)?;
            let decoded = load_image(image)?;
            let engine = PrnuEngine::new(config, store)?;
            let scan = engine.detect_tampering(decoded, camera_id.as_str()).wait()?;
            if cli.json {
                print_json(&scan)?;
            } else {
                print_scan(image, &scan, cli.quiet);
            }
            if scan.is_tampered {
                process::exit(1);
            }
            Ok(())
        }
        Command::List => {
            let (_, store) = open_store(cli)?;
            let ids = store.list_ids()?;
            if cli.json {
                print_json(&ids)?;
            } else {
                for id in ids {
                    println!("{id}");
                }
            }
            Ok(())
        }
        Command::Delete { camera_id } => {
            let (_, store) = open_store(cli)?;
            store.delete(camera_id)?;
            if !cli.quiet {
                eprintln!("[OK] {camera_id} deleted");
            }
            Ok(())
        }
        Command::Keygen => {
            println!("{}", StoreKey::generate().to_hex());
            Ok(())
        }
    }
}

/// Expand directories into their supported image files, sorted.
fn collect_images(paths: &[PathBuf]) -> prnu_forensics::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let entries = std::fs::read_dir(path).map_err(|e| {
                prnu_forensics::Error::ImageProcessingFailure(format!("{}: {e}", path.display()))
            })?;
            let mut found: Vec<PathBuf> = entries
                .filter_map(std::result::Result::ok)
                .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
                .map(|e| e.path())
                .filter(|p| is_supported_image(p))
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn load_all(paths: &[PathBuf]) -> prnu_forensics::Result<Vec<DynamicImage>> {
    paths.iter().map(|p| load_image(p)).collect()
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> prnu_forensics::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| prnu_forensics::Error::ProcessingFailure(e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    )
}

fn print_verdict(path: &Path, result: &AuthenticationResult, quiet: bool) {
    let name = display_name(path);
    if result.is_authentic {
        if !quiet {
            eprintln!(
                "[OK] {name}: PCE {:.1} ({:.0}% confidence, {})",
                result.pce_score, result.confidence, result.quality
            );
        }
    } else {
        eprintln!(
            "[FAIL] {name}: PCE {:.1} below threshold ({:.0}% confidence, {})",
            result.pce_score, result.confidence, result.quality
        );
    }
}

fn print_scan(path: &Path, scan: &TamperDetectionResult, quiet: bool) {
    let name = display_name(path);
    if !scan.is_tampered {
        if !quiet {
            eprintln!(
                "[OK] {name}: no tampering across {} blocks (mean PCE {:.1})",
                scan.total_blocks, scan.overall_pce
            );
        }
        return;
    }
    eprintln!(
        "[FAIL] {name}: {}/{} blocks flagged, severity {} ({:.0}% confidence)",
        scan.tampered_regions.len(),
        scan.total_blocks,
        scan.severity,
        scan.confidence
    );
    for r in &scan.tampered_regions {
        eprintln!("  -> {}x{} at ({}, {})", r.width, r.height, r.x, r.y);
    }
}
