use std::error::Error;
use std::path::Path;
use wesad_importer::{LabelCode, LoaderConfig, SegmentLoader, SegmentStore};

// RespiBAN chest channels are sampled at 700 Hz
const CHEST_SAMPLE_RATE: f64 = 700.0;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Either a TOML config file or a dataset root directory
    let config = match std::env::args().nth(1) {
        Some(arg) if arg.ends_with(".toml") => LoaderConfig::from_toml_file(Path::new(&arg))?,
        Some(root) => LoaderConfig::new().with_root_path(root),
        None => LoaderConfig::new(),
    };

    let loader = SegmentLoader::new(config);
    let mut store = SegmentStore::new();
    loader.load_all(&mut store)?;

    println!("\nSubjects loaded: {:?}", store.subjects());
    for key in &loader.config().channels {
        println!("\n{}:", key);
        for code in LabelCode::ALL {
            println!(
                "  {:<10} {} samples across {} entries",
                code,
                store.total_samples(code, key),
                store.for_label(code).len()
            );
            for (subject, segment) in store.channel_segments(code, key) {
                println!("    S{}: {:.1} s", subject, segment.duration(CHEST_SAMPLE_RATE));
            }
        }
    }

    Ok(())
}
