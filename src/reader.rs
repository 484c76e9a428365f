use ndarray::{Array1, Array2, Ix2};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;

use crate::pickle::{self, NdArray, TextDecoding, Value};
use crate::types::*;

const LABEL_KEY: &str = "label";
const SIGNAL_KEY: &str = "signal";
const SUBJECT_KEY: &str = "subject";

/// Loads a WESAD archive and returns a strongly-typed recording.
///
/// The file is read through a buffered reader and closed when this function
/// returns, whether decoding succeeded or not.
///
/// # Arguments
///
/// * `file_path` - Path to the `.pkl` archive
/// * `decoding` - How Python 2 byte strings inside the archive are decoded
///
/// # Returns
///
/// A `Result` containing either the loaded `Recording` or an error. Decoder
/// errors are returned unchanged inside `WesadError::Decode`.
pub fn load_file<P: AsRef<Path>>(file_path: P, decoding: TextDecoding) -> Result<Recording> {
    let tic = Instant::now();

    // Open file with buffered reader for better I/O performance
    let file = File::open(file_path.as_ref())?;
    let reader = BufReader::with_capacity(65536, file); // 64KB buffer

    let value = pickle::decode(reader, decoding)?;
    let recording = recording_from_value(value)?;

    log_recording_summary(&recording);
    log::debug!(
        "Decoded {:?} in {:.1} seconds",
        file_path.as_ref(),
        tic.elapsed().as_secs_f64()
    );

    Ok(recording)
}

/// Converts a decoded archive into a `Recording`.
///
/// The archive must be a dict with a `label` array and a `signal` dict of
/// device dicts. Arrays are moved out of the value, not copied.
pub fn recording_from_value(value: Value) -> Result<Recording> {
    let mut entries = match value {
        Value::Dict(entries) => entries,
        other => return Err(unexpected("archive", "dict", &other)),
    };

    let label = take_entry(&mut entries, LABEL_KEY)
        .ok_or_else(|| WesadError::MissingKey(LABEL_KEY.to_string()))?;
    let label = label_from_value(label)?;

    let signal = take_entry(&mut entries, SIGNAL_KEY)
        .ok_or_else(|| WesadError::MissingKey(SIGNAL_KEY.to_string()))?;
    let signal = match signal {
        Value::Dict(devices) => devices,
        other => return Err(unexpected(SIGNAL_KEY, "dict", &other)),
    };

    let mut devices = BTreeMap::new();
    for (device_key, device_value) in signal {
        let device = key_text(&device_key, SIGNAL_KEY)?;
        let channels = match device_value {
            Value::Dict(channels) => channels,
            other => return Err(unexpected(&device, "dict", &other)),
        };

        let mut device_signals = DeviceSignals::new();
        for (channel_key, channel_value) in channels {
            let channel = key_text(&channel_key, &device)?;
            let samples = channel_from_value(channel_value, &device, &channel)?;
            device_signals.insert(channel, samples);
        }
        devices.insert(device, device_signals);
    }

    let subject = take_entry(&mut entries, SUBJECT_KEY).and_then(|v| match v {
        Value::Text(s) => Some(s),
        Value::Bytes(b) => Some(b.iter().map(|&b| b as char).collect()),
        _ => None,
    });

    Ok(Recording {
        subject,
        label,
        signal: devices,
    })
}

fn take_entry(entries: &mut Vec<(Value, Value)>, key: &str) -> Option<Value> {
    let index = entries.iter().position(|(k, _)| k.key_matches(key))?;
    Some(entries.swap_remove(index).1)
}

fn key_text(key: &Value, field: &str) -> Result<String> {
    match key {
        Value::Text(s) => Ok(s.clone()),
        Value::Bytes(b) => Ok(b.iter().map(|&b| b as char).collect()),
        other => Err(unexpected(field, "text keys", other)),
    }
}

fn unexpected(field: &str, expected: &str, found: &Value) -> WesadError {
    WesadError::UnexpectedType {
        field: field.to_string(),
        expected: format!("{}, found {}", expected, found.type_name()),
    }
}

/// Flattens the label array (WESAD stores it as 1-D int32) into codes.
///
/// Codes that do not fit `i32` or are not whole numbers are rejected rather
/// than truncated onto a valid condition.
fn label_from_value(value: Value) -> Result<Array1<i32>> {
    match value {
        Value::Array(NdArray::Int(array)) => array.iter().map(|&v| int_label(v)).collect(),
        Value::Array(NdArray::Float(array)) => array.iter().map(|&v| float_label(v)).collect(),
        Value::Array(NdArray::Bool(array)) => Ok(array.iter().map(|&v| v as i32).collect()),
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Int(v) => int_label(*v),
                Value::Float(v) => float_label(*v),
                Value::Bool(v) => Ok(*v as i32),
                other => Err(unexpected(LABEL_KEY, "integer codes", other)),
            })
            .collect(),
        other => Err(unexpected(LABEL_KEY, "array", &other)),
    }
}

fn int_label(value: i64) -> Result<i32> {
    i32::try_from(value).map_err(|_| WesadError::UnexpectedType {
        field: LABEL_KEY.to_string(),
        expected: format!("32-bit label codes, found {}", value),
    })
}

fn float_label(value: f64) -> Result<i32> {
    if value.fract() != 0.0 || value < i32::MIN as f64 || value > i32::MAX as f64 {
        return Err(WesadError::UnexpectedType {
            field: LABEL_KEY.to_string(),
            expected: format!("integral label codes, found {}", value),
        });
    }
    Ok(value as i32)
}

/// Shapes a channel as `[samples, components]`.
fn channel_from_value(value: Value, device: &str, channel: &str) -> Result<Array2<f64>> {
    let field = format!("{}/{}", device, channel);
    let array = match value {
        Value::Array(array) => array,
        Value::List(items) => {
            let samples = items
                .iter()
                .map(|item| match item {
                    Value::Int(v) => Ok(*v as f64),
                    Value::Float(v) => Ok(*v),
                    other => Err(unexpected(&field, "numeric samples", other)),
                })
                .collect::<Result<Vec<f64>>>()?;
            NdArray::Float(Array1::from(samples).into_dyn())
        }
        other => return Err(unexpected(&field, "array", &other)),
    };

    let array = array.into_f64();
    match array.ndim() {
        1 => {
            let len = array.len();
            array
                .into_shape_with_order((len, 1))
                .map_err(|e| WesadError::UnexpectedType {
                    field,
                    expected: e.to_string(),
                })
        }
        2 => array
            .into_dimensionality::<Ix2>()
            .map_err(|e| WesadError::UnexpectedType {
                field,
                expected: e.to_string(),
            }),
        n => Err(WesadError::UnexpectedType {
            field,
            expected: format!("1-D or 2-D array, found {}-D", n),
        }),
    }
}

// Helper function to log a recording summary
fn log_recording_summary(recording: &Recording) {
    log::debug!(
        "Found {} labeled sample{}.",
        recording.num_samples(),
        plural(recording.num_samples())
    );

    for (device, channels) in &recording.signal {
        log::debug!(
            "Found {} {} channel{}: {}",
            channels.len(),
            device,
            plural(channels.len()),
            channels.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    }
}

fn plural(count: usize) -> &'static str {
    if count != 1 {
        "s"
    } else {
        ""
    }
}
