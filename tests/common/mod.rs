//! Writes small WESAD-style archives the way Python 2 pickles them
//! (protocol 2, byte strings for text, numpy arrays via `_reconstruct`).

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct ArchiveWriter {
    out: Vec<u8>,
    next_memo: u8,
    float_dtype: Option<u8>,
    int_dtype: Option<u8>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        ArchiveWriter {
            out: vec![0x80, 2],
            next_memo: 0,
            float_dtype: None,
            int_dtype: None,
        }
    }

    fn memoize(&mut self) -> u8 {
        let key = self.next_memo;
        self.out.extend_from_slice(&[b'q', key]);
        self.next_memo += 1;
        key
    }

    pub fn byte_string(&mut self, bytes: &[u8]) {
        if bytes.len() < 256 {
            self.out.push(b'U');
            self.out.push(bytes.len() as u8);
        } else {
            self.out.push(b'T');
            self.out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
        }
        self.out.extend_from_slice(bytes);
    }

    fn dtype(&mut self, spec: &str) {
        let cached = if spec == "f8" { self.float_dtype } else { self.int_dtype };
        if let Some(key) = cached {
            self.out.extend_from_slice(&[b'h', key]);
            return;
        }

        self.out.extend_from_slice(b"cnumpy\ndtype\n");
        self.byte_string(spec.as_bytes());
        self.out.extend_from_slice(&[b'K', 0, b'K', 1, 0x87, b'R']);
        let key = self.memoize();
        self.out.extend_from_slice(&[b'(', b'K', 3]);
        self.byte_string(b"<");
        self.out.extend_from_slice(&[b'N', b'N', b'N']);
        self.out.push(b'J');
        self.out.extend_from_slice(&(-1i32).to_le_bytes());
        self.out.push(b'J');
        self.out.extend_from_slice(&(-1i32).to_le_bytes());
        self.out.extend_from_slice(&[b'K', 0, b't', b'b']);

        if spec == "f8" {
            self.float_dtype = Some(key);
        } else {
            self.int_dtype = Some(key);
        }
    }

    fn array(&mut self, shape: &[usize], spec: &str, raw: &[u8]) {
        self.out.extend_from_slice(b"cnumpy.core.multiarray\n_reconstruct\n");
        self.out.extend_from_slice(b"cnumpy\nndarray\n");
        self.out.extend_from_slice(&[b'K', 0, 0x85]);
        self.byte_string(b"b");
        self.out.extend_from_slice(&[0x87, b'R']);
        self.out.extend_from_slice(&[b'(', b'K', 1, b'(']);
        for &dim in shape {
            self.out.push(b'J');
            self.out.extend_from_slice(&(dim as i32).to_le_bytes());
        }
        self.out.push(b't');
        self.dtype(spec);
        self.out.push(0x89);
        self.byte_string(raw);
        self.out.extend_from_slice(&[b't', b'b']);
    }

    /// A float64 column of shape `(n, 1)`, as WESAD stores chest channels.
    pub fn column(&mut self, values: &[f64]) {
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.array(&[values.len(), 1], "f8", &raw);
    }

    /// A 1-D int32 array, as WESAD stores labels.
    pub fn labels(&mut self, values: &[i32]) {
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.array(&[values.len()], "i4", &raw);
    }

    fn device(&mut self, channels: &[(&str, &[f64])]) {
        self.out.extend_from_slice(&[b'}', b'(']);
        for (name, values) in channels {
            self.byte_string(name.as_bytes());
            self.column(values);
        }
        self.out.push(b'u');
    }

    /// `{'signal': {'chest': {...}, 'wrist': {...}}, 'label': ..., 'subject': ...}`
    pub fn recording(
        mut self,
        subject: &[u8],
        labels: &[i32],
        chest: &[(&str, &[f64])],
        wrist: &[(&str, &[f64])],
    ) -> Vec<u8> {
        self.out.extend_from_slice(&[b'}', b'(']);
        self.byte_string(b"signal");
        self.out.extend_from_slice(&[b'}', b'(']);
        self.byte_string(b"chest");
        self.device(chest);
        self.byte_string(b"wrist");
        self.device(wrist);
        self.out.push(b'u');
        self.byte_string(b"label");
        self.labels(labels);
        self.byte_string(b"subject");
        self.byte_string(subject);
        self.out.extend_from_slice(&[b'u', b'.']);
        self.out
    }
}

/// Labels and chest ECG used across the tests.
pub const LABELS: [i32; 6] = [1, 1, 2, 2, 3, 1];
pub const ECG: [f64; 6] = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0];
pub const EDA: [f64; 6] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];

pub fn standard_archive(subject: u32) -> Vec<u8> {
    ArchiveWriter::new().recording(
        format!("S{}", subject).as_bytes(),
        &LABELS,
        &[("ECG", &ECG[..]), ("EDA", &EDA[..])],
        &[("BVP", &[0.5, 0.6, 0.7, 0.8, 0.9, 1.0][..])],
    )
}

/// Writes `bytes` to `<root>/S<id>/S<id>.pkl`.
pub fn write_subject(root: &Path, subject: u32, bytes: &[u8]) -> PathBuf {
    let name = format!("S{}", subject);
    let dir = root.join(&name);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.pkl", name));
    fs::write(&path, bytes).unwrap();
    path
}
