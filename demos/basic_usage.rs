use std::error::Error;
use wesad_importer::{load, ChannelKey, LabelCode, CHEST_DEVICE};

// RespiBAN chest channels are sampled at 700 Hz
const CHEST_SAMPLE_RATE: f64 = 700.0;

fn main() -> Result<(), Box<dyn Error>> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "data/WESAD/S2/S2.pkl".to_string());

    // Load one subject archive
    let recording = load(&path)?;

    if let Some(subject) = &recording.subject {
        println!("Subject: {}", subject);
    }
    println!("Number of labeled samples: {}", recording.num_samples());

    // Print device groups and their channels
    for (device, channels) in &recording.signal {
        println!("\n{} channels:", device);
        for (name, samples) in channels {
            println!("  {}: {} samples x {} components", name, samples.nrows(), samples.ncols());
        }
    }

    // Count samples per study condition
    println!("\nLabel counts:");
    for (code, count) in recording.label_counts() {
        println!(
            "  {} ({}): {} samples, {:.1} seconds",
            code,
            code.code(),
            count,
            count as f64 / CHEST_SAMPLE_RATE
        );
    }

    // Show the first few ECG samples of the stress condition
    let ecg = ChannelKey::chest_ecg();
    if let Some(samples) = recording.channel(&ecg) {
        let stress: Vec<f64> = recording
            .label
            .iter()
            .zip(samples.column(0))
            .filter(|(&label, _)| label == LabelCode::Stress.code())
            .map(|(_, &value)| value)
            .take(5)
            .collect();
        println!("\nFirst {} stress samples of {}:", stress.len(), ecg);
        for (i, value) in stress.iter().enumerate() {
            println!("  {}: {} mV", i, value);
        }
    } else {
        println!("\nNo ECG channel in the {} group.", CHEST_DEVICE);
    }

    Ok(())
}
