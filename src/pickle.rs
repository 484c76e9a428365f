//! Decoder for Python pickle streams as written for the WESAD archives.
//!
//! The archives were produced by Python 2 with numpy, so the decoder has to
//! understand protocol 0-2 opcodes, legacy 8-bit strings and numpy's array
//! reconstruction protocol. Newer protocols (up to 5) are accepted as well so
//! that re-exported archives keep loading.
//!
//! Decoding runs the pickle machine over an arena of nodes. The stack and the
//! memo hold node ids, which keeps memoized objects shared: a dtype that is
//! fetched from the memo sees the byte order its BUILD applied, and a dict
//! filled by SETITEMS after being memoized is the same dict everywhere.

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, BufRead, Read};

// Opcodes (see Python's pickletools for the reference list)
const MARK: u8 = b'(';
const STOP: u8 = b'.';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const FLOAT: u8 = b'F';
const INT: u8 = b'I';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const LONG: u8 = b'L';
const BININT2: u8 = b'M';
const NONE: u8 = b'N';
const REDUCE: u8 = b'R';
const STRING: u8 = b'S';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const UNICODE: u8 = b'V';
const BINUNICODE: u8 = b'X';
const APPEND: u8 = b'a';
const BUILD: u8 = b'b';
const GLOBAL: u8 = b'c';
const DICT: u8 = b'd';
const EMPTY_DICT: u8 = b'}';
const APPENDS: u8 = b'e';
const GET: u8 = b'g';
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const LIST: u8 = b'l';
const EMPTY_LIST: u8 = b']';
const PUT: u8 = b'p';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const SETITEM: u8 = b's';
const TUPLE: u8 = b't';
const EMPTY_TUPLE: u8 = b')';
const SETITEMS: u8 = b'u';
const BINFLOAT: u8 = b'G';
const PROTO: u8 = 0x80;
const NEWOBJ: u8 = 0x81;
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES8: u8 = 0x8e;
const EMPTY_SET: u8 = 0x8f;
const ADDITEMS: u8 = 0x90;
const FROZENSET: u8 = 0x91;
const NEWOBJ_EX: u8 = 0x92;
const STACK_GLOBAL: u8 = 0x93;
const MEMOIZE: u8 = 0x94;
const FRAME: u8 = 0x95;
const BYTEARRAY8: u8 = 0x96;

const HIGHEST_PROTOCOL: u8 = 5;
const MAX_DEPTH: usize = 512;

// Upper bound on values copied when memo-shared nodes are referenced again
const MAX_SHARED_VALUES: usize = 1 << 18;

/// How legacy 8-bit strings (Python 2 `str`) are turned into values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextDecoding {
    /// Every byte becomes the code point of the same value. Never fails.
    #[default]
    Latin1,
    /// Strict UTF-8. Fails on byte strings that are not valid UTF-8.
    Utf8,
    /// Keep the raw bytes.
    Bytes,
}

/// Errors raised while decoding a pickle stream.
#[derive(Debug, thiserror::Error)]
pub enum PickleError {
    #[error("Unknown or unsupported opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Stack underflow at opcode 0x{0:02x}")]
    StackUnderflow(u8),

    #[error("No mark on the stack")]
    MissingMark,

    #[error("Memo key {0} not found")]
    MissingMemo(u32),

    #[error("Invalid text: {0}")]
    InvalidText(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Invalid array: {0}")]
    InvalidArray(String),

    #[error("Malformed pickle: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for PickleError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            PickleError::UnexpectedEof
        } else {
            PickleError::Io(error)
        }
    }
}

type Result<T> = std::result::Result<T, PickleError>;

/// Element kind of a numpy dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtypeKind {
    Bool,
    Int,
    UInt,
    Float,
}

/// A numeric numpy dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    pub kind: DtypeKind,
    /// Item size in bytes
    pub size: usize,
    pub big_endian: bool,
}

impl Dtype {
    /// Parses a dtype string such as `f8`, `<i4`, `|b1` or `?`.
    pub fn parse(spec: &str) -> Result<Dtype> {
        let (big_endian, rest) = match spec.chars().next() {
            Some('>') => (true, &spec[1..]),
            Some('<') | Some('=') | Some('|') => (false, &spec[1..]),
            _ => (false, spec),
        };
        if rest == "?" {
            return Ok(Dtype {
                kind: DtypeKind::Bool,
                size: 1,
                big_endian,
            });
        }

        let unsupported = || PickleError::UnsupportedDtype(spec.to_string());
        let mut chars = rest.chars();
        let kind = match chars.next() {
            Some('b') => DtypeKind::Bool,
            Some('i') => DtypeKind::Int,
            Some('u') => DtypeKind::UInt,
            Some('f') => DtypeKind::Float,
            _ => return Err(unsupported()),
        };
        let size: usize = chars.as_str().parse().map_err(|_| unsupported())?;

        let valid = match kind {
            DtypeKind::Bool => size == 1,
            DtypeKind::Int | DtypeKind::UInt => matches!(size, 1 | 2 | 4 | 8),
            DtypeKind::Float => matches!(size, 4 | 8),
        };
        if !valid {
            return Err(unsupported());
        }

        Ok(Dtype {
            kind,
            size,
            big_endian,
        })
    }
}

/// A decoded numpy array in standard (row-major) layout.
#[derive(Debug, Clone, PartialEq)]
pub enum NdArray {
    Float(ArrayD<f64>),
    Int(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

impl NdArray {
    pub fn shape(&self) -> &[usize] {
        match self {
            NdArray::Float(a) => a.shape(),
            NdArray::Int(a) => a.shape(),
            NdArray::Bool(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts every element to `f64`.
    pub fn into_f64(self) -> ArrayD<f64> {
        match self {
            NdArray::Float(a) => a,
            NdArray::Int(a) => a.mapv(|v| v as f64),
            NdArray::Bool(a) => a.mapv(|v| if v { 1.0 } else { 0.0 }),
        }
    }

    /// Converts every element to `i64`, truncating floats.
    pub fn into_i64(self) -> ArrayD<i64> {
        match self {
            NdArray::Float(a) => a.mapv(|v| v as i64),
            NdArray::Int(a) => a,
            NdArray::Bool(a) => a.mapv(i64::from),
        }
    }
}

/// A decoded pickle value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Entries in insertion order
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Array(NdArray),
    Dtype(Dtype),
    /// A global reference that was never called
    Global { module: String, name: String },
    /// An instance of a class this decoder does not model
    Object {
        module: String,
        name: String,
        args: Vec<Value>,
        state: Option<Box<Value>>,
    },
}

impl Value {
    /// Looks up a dict entry by string key. Byte-string keys match too.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.key_matches(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// True when this value is a text or byte-string equal to `key`.
    pub fn key_matches(&self, key: &str) -> bool {
        match self {
            Value::Text(s) => s == key,
            Value::Bytes(b) => b.as_slice() == key.as_bytes(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Array(_) => "array",
            Value::Dtype(_) => "dtype",
            Value::Global { .. } => "global",
            Value::Object { .. } => "object",
        }
    }
}

/// Decodes one pickled object from a buffered reader.
pub fn decode<R: BufRead>(reader: R, decoding: TextDecoding) -> Result<Value> {
    Machine::new(reader, decoding).run()
}

/// Decodes one pickled object from a byte slice.
pub fn from_slice(bytes: &[u8], decoding: TextDecoding) -> Result<Value> {
    decode(bytes, decoding)
}

type NodeId = usize;

#[derive(Clone)]
enum Node {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<NodeId>),
    Tuple(Vec<NodeId>),
    Dict(Vec<(NodeId, NodeId)>),
    Set(Vec<NodeId>),
    Global { module: String, name: String },
    Dtype(Dtype),
    Array(NdArray),
    // Result of numpy's _reconstruct, waiting for its BUILD state
    PendingArray,
    Object {
        module: String,
        name: String,
        args: Vec<NodeId>,
        state: Option<NodeId>,
    },
}

struct Machine<R> {
    reader: R,
    decoding: TextDecoding,
    heap: Vec<Node>,
    stack: Vec<NodeId>,
    marks: Vec<usize>,
    memo: HashMap<u32, NodeId>,
}

impl<R: BufRead> Machine<R> {
    fn new(reader: R, decoding: TextDecoding) -> Self {
        Machine {
            reader,
            decoding,
            heap: Vec::new(),
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<Value> {
        loop {
            let opcode = self.reader.read_u8()?;
            match opcode {
                PROTO => {
                    let version = self.reader.read_u8()?;
                    if version > HIGHEST_PROTOCOL {
                        return Err(PickleError::Malformed(format!(
                            "unsupported protocol {}",
                            version
                        )));
                    }
                }
                FRAME => {
                    // Frames only group opcodes for buffering
                    self.reader.read_u64::<LittleEndian>()?;
                }
                STOP => {
                    let root = self.pop(opcode)?;
                    return Resolver::new(std::mem::take(&mut self.heap), root).run(root);
                }

                MARK => self.marks.push(self.stack.len()),
                POP => {
                    if self.stack.len() > self.frame_start() {
                        self.stack.pop();
                    } else {
                        self.pop_mark()?;
                    }
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                DUP => {
                    let top = self.top(opcode)?;
                    self.stack.push(top);
                }

                NONE => self.push(Node::None),
                NEWTRUE => self.push(Node::Bool(true)),
                NEWFALSE => self.push(Node::Bool(false)),
                INT => {
                    let line = self.read_text_line()?;
                    let node = match line.as_str() {
                        "00" => Node::Bool(false),
                        "01" => Node::Bool(true),
                        _ => Node::Int(parse_int(&line)?),
                    };
                    self.push(node);
                }
                BININT => {
                    let value = self.reader.read_i32::<LittleEndian>()?;
                    self.push(Node::Int(value as i64));
                }
                BININT1 => {
                    let value = self.reader.read_u8()?;
                    self.push(Node::Int(value as i64));
                }
                BININT2 => {
                    let value = self.reader.read_u16::<LittleEndian>()?;
                    self.push(Node::Int(value as i64));
                }
                LONG => {
                    let line = self.read_text_line()?;
                    let digits = line.strip_suffix('L').unwrap_or(&line);
                    self.push(Node::Int(parse_int(digits)?));
                }
                LONG1 => {
                    let len = self.reader.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.push(Node::Int(decode_long(&bytes)?));
                }
                LONG4 => {
                    let len = self.read_length_i32()?;
                    let bytes = self.read_bytes(len)?;
                    self.push(Node::Int(decode_long(&bytes)?));
                }
                FLOAT => {
                    let line = self.read_text_line()?;
                    let value = line
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| PickleError::Malformed(format!("invalid float '{}'", line)))?;
                    self.push(Node::Float(value));
                }
                BINFLOAT => {
                    let value = self.reader.read_f64::<BigEndian>()?;
                    self.push(Node::Float(value));
                }

                STRING => {
                    let line = self.read_line()?;
                    let bytes = unquote_string(&line)?;
                    let node = self.legacy_string(bytes)?;
                    self.push(node);
                }
                BINSTRING => {
                    let len = self.read_length_i32()?;
                    let bytes = self.read_bytes(len)?;
                    let node = self.legacy_string(bytes)?;
                    self.push(node);
                }
                SHORT_BINSTRING => {
                    let len = self.reader.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    let node = self.legacy_string(bytes)?;
                    self.push(node);
                }
                UNICODE => {
                    let line = self.read_line()?;
                    self.push(Node::Text(decode_raw_unicode_escape(&line)?));
                }
                BINUNICODE => {
                    let len = self.reader.read_u32::<LittleEndian>()? as usize;
                    let text = self.read_utf8(len)?;
                    self.push(Node::Text(text));
                }
                SHORT_BINUNICODE => {
                    let len = self.reader.read_u8()? as usize;
                    let text = self.read_utf8(len)?;
                    self.push(Node::Text(text));
                }
                BINUNICODE8 => {
                    let len = self.read_length_u64()?;
                    let text = self.read_utf8(len)?;
                    self.push(Node::Text(text));
                }
                BINBYTES => {
                    let len = self.reader.read_u32::<LittleEndian>()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.push(Node::Bytes(bytes));
                }
                SHORT_BINBYTES => {
                    let len = self.reader.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.push(Node::Bytes(bytes));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let len = self.read_length_u64()?;
                    let bytes = self.read_bytes(len)?;
                    self.push(Node::Bytes(bytes));
                }

                EMPTY_LIST => self.push(Node::List(Vec::new())),
                EMPTY_TUPLE => self.push(Node::Tuple(Vec::new())),
                EMPTY_DICT => self.push(Node::Dict(Vec::new())),
                EMPTY_SET => self.push(Node::Set(Vec::new())),
                LIST => {
                    let items = self.pop_mark()?;
                    self.push(Node::List(items));
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Node::Tuple(items));
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let count = (opcode - TUPLE1 + 1) as usize;
                    // Items below the most recent mark belong to an enclosing frame
                    if self.stack.len() < self.frame_start() + count {
                        return Err(PickleError::StackUnderflow(opcode));
                    }
                    let items = self.stack.split_off(self.stack.len() - count);
                    self.push(Node::Tuple(items));
                }
                DICT => {
                    let items = self.pop_mark()?;
                    let pairs = into_pairs(items)?;
                    self.push(Node::Dict(pairs));
                }
                FROZENSET => {
                    let items = self.pop_mark()?;
                    self.push(Node::Set(items));
                }

                APPEND => {
                    let value = self.pop(opcode)?;
                    let target = self.top(opcode)?;
                    self.extend_sequence(target, vec![value])?;
                }
                APPENDS | ADDITEMS => {
                    let items = self.pop_mark()?;
                    let target = self.top(opcode)?;
                    self.extend_sequence(target, items)?;
                }
                SETITEM => {
                    let value = self.pop(opcode)?;
                    let key = self.pop(opcode)?;
                    let target = self.top(opcode)?;
                    self.set_items(target, vec![(key, value)])?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = into_pairs(items)?;
                    let target = self.top(opcode)?;
                    self.set_items(target, pairs)?;
                }

                PUT => {
                    let key = parse_memo_key(&self.read_text_line()?)?;
                    let top = self.top(opcode)?;
                    self.memo.insert(key, top);
                }
                BINPUT => {
                    let key = self.reader.read_u8()? as u32;
                    let top = self.top(opcode)?;
                    self.memo.insert(key, top);
                }
                LONG_BINPUT => {
                    let key = self.reader.read_u32::<LittleEndian>()?;
                    let top = self.top(opcode)?;
                    self.memo.insert(key, top);
                }
                MEMOIZE => {
                    let key = self.memo.len() as u32;
                    let top = self.top(opcode)?;
                    self.memo.insert(key, top);
                }
                GET => {
                    let key = parse_memo_key(&self.read_text_line()?)?;
                    self.push_memo(key)?;
                }
                BINGET => {
                    let key = self.reader.read_u8()? as u32;
                    self.push_memo(key)?;
                }
                LONG_BINGET => {
                    let key = self.reader.read_u32::<LittleEndian>()?;
                    self.push_memo(key)?;
                }

                GLOBAL => {
                    let module = self.read_text_line()?;
                    let name = self.read_text_line()?;
                    self.push(Node::Global { module, name });
                }
                STACK_GLOBAL => {
                    let name = self.pop(opcode)?;
                    let module = self.pop(opcode)?;
                    let name = self.node_text(name).ok_or_else(|| {
                        PickleError::Malformed("STACK_GLOBAL name is not text".to_string())
                    })?;
                    let module = self.node_text(module).ok_or_else(|| {
                        PickleError::Malformed("STACK_GLOBAL module is not text".to_string())
                    })?;
                    self.push(Node::Global { module, name });
                }
                REDUCE | NEWOBJ => {
                    let args = self.pop(opcode)?;
                    let callable = self.pop(opcode)?;
                    let node = self.call(callable, args)?;
                    self.push(node);
                }
                NEWOBJ_EX => {
                    let _kwargs = self.pop(opcode)?;
                    let args = self.pop(opcode)?;
                    let class = self.pop(opcode)?;
                    let node = self.call(class, args)?;
                    self.push(node);
                }
                BUILD => {
                    let state = self.pop(opcode)?;
                    let target = self.top(opcode)?;
                    self.build(target, state)?;
                }

                other => return Err(PickleError::UnknownOpcode(other)),
            }
        }
    }

    fn push(&mut self, node: Node) {
        self.heap.push(node);
        self.stack.push(self.heap.len() - 1);
    }

    /// Stack height when the most recent mark was set.
    fn frame_start(&self) -> usize {
        self.marks.last().copied().unwrap_or(0)
    }

    fn pop(&mut self, opcode: u8) -> Result<NodeId> {
        if self.stack.len() <= self.frame_start() {
            return Err(PickleError::StackUnderflow(opcode));
        }
        self.stack.pop().ok_or(PickleError::StackUnderflow(opcode))
    }

    fn top(&self, opcode: u8) -> Result<NodeId> {
        self.stack
            .last()
            .copied()
            .ok_or(PickleError::StackUnderflow(opcode))
    }

    /// Pops everything above the most recent mark, in stack order.
    fn pop_mark(&mut self) -> Result<Vec<NodeId>> {
        let start = self.marks.pop().ok_or(PickleError::MissingMark)?;
        if start > self.stack.len() {
            return Err(PickleError::MissingMark);
        }
        Ok(self.stack.split_off(start))
    }

    fn push_memo(&mut self, key: u32) -> Result<()> {
        let id = *self.memo.get(&key).ok_or(PickleError::MissingMemo(key))?;
        self.stack.push(id);
        Ok(())
    }

    /// Reads a newline-terminated argument without the line ending.
    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        self.reader.read_until(b'\n', &mut line)?;
        if line.pop() != Some(b'\n') {
            return Err(PickleError::UnexpectedEof);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    fn read_text_line(&mut self) -> Result<String> {
        let line = self.read_line()?;
        Ok(line.iter().map(|&b| b as char).collect())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        // Read through `take` so a corrupt length cannot force a huge allocation
        let mut bytes = Vec::new();
        (&mut self.reader).take(len as u64).read_to_end(&mut bytes)?;
        if bytes.len() != len {
            return Err(PickleError::UnexpectedEof);
        }
        Ok(bytes)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| PickleError::InvalidText(e.to_string()))
    }

    fn read_length_i32(&mut self) -> Result<usize> {
        let len = self.reader.read_i32::<LittleEndian>()?;
        usize::try_from(len).map_err(|_| PickleError::Malformed(format!("negative length {}", len)))
    }

    fn read_length_u64(&mut self) -> Result<usize> {
        let len = self.reader.read_u64::<LittleEndian>()?;
        usize::try_from(len).map_err(|_| PickleError::Malformed(format!("length {} too large", len)))
    }

    /// Turns a Python 2 `str` into a node according to the decoding mode.
    fn legacy_string(&self, bytes: Vec<u8>) -> Result<Node> {
        match self.decoding {
            TextDecoding::Latin1 => Ok(Node::Text(bytes.iter().map(|&b| b as char).collect())),
            TextDecoding::Utf8 => String::from_utf8(bytes)
                .map(Node::Text)
                .map_err(|e| PickleError::InvalidText(e.to_string())),
            TextDecoding::Bytes => Ok(Node::Bytes(bytes)),
        }
    }

    /// Text of a text or byte-string node.
    fn node_text(&self, id: NodeId) -> Option<String> {
        match &self.heap[id] {
            Node::Text(s) => Some(s.clone()),
            Node::Bytes(b) => Some(b.iter().map(|&b| b as char).collect()),
            _ => None,
        }
    }

    /// Raw bytes of a byte-string node, or of text produced from one.
    fn node_bytes(&self, id: NodeId) -> Result<Vec<u8>> {
        match &self.heap[id] {
            Node::Bytes(b) => Ok(b.clone()),
            Node::Text(s) => match self.decoding {
                TextDecoding::Latin1 => latin1_bytes(s),
                _ => Ok(s.as_bytes().to_vec()),
            },
            _ => Err(PickleError::InvalidArray(
                "raw data is not a byte string".to_string(),
            )),
        }
    }

    fn node_int(&self, id: NodeId) -> Option<i64> {
        match &self.heap[id] {
            Node::Int(v) => Some(*v),
            Node::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    fn node_dtype(&self, id: NodeId) -> Result<Dtype> {
        match &self.heap[id] {
            Node::Dtype(dtype) => Ok(*dtype),
            Node::Text(_) | Node::Bytes(_) => {
                let spec = self.node_text(id).unwrap_or_default();
                Dtype::parse(&spec)
            }
            _ => Err(PickleError::InvalidArray("missing dtype".to_string())),
        }
    }

    fn node_shape(&self, id: NodeId) -> Result<Vec<usize>> {
        let items = match &self.heap[id] {
            Node::Tuple(items) | Node::List(items) => items,
            Node::Int(_) => return self.dimension(id).map(|d| vec![d]),
            _ => return Err(PickleError::InvalidArray("shape is not a tuple".to_string())),
        };
        items.iter().map(|&item| self.dimension(item)).collect()
    }

    fn dimension(&self, id: NodeId) -> Result<usize> {
        self.node_int(id)
            .and_then(|d| usize::try_from(d).ok())
            .ok_or_else(|| PickleError::InvalidArray("invalid dimension".to_string()))
    }

    fn items_of(&self, id: NodeId) -> Vec<NodeId> {
        match &self.heap[id] {
            Node::List(items) | Node::Tuple(items) | Node::Set(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    fn extend_sequence(&mut self, target: NodeId, values: Vec<NodeId>) -> Result<()> {
        match &mut self.heap[target] {
            Node::List(items) | Node::Set(items) => {
                items.extend(values);
                Ok(())
            }
            _ => Err(PickleError::Malformed(
                "append target is not a list or set".to_string(),
            )),
        }
    }

    fn set_items(&mut self, target: NodeId, pairs: Vec<(NodeId, NodeId)>) -> Result<()> {
        if !matches!(self.heap[target], Node::Dict(_)) {
            return Err(PickleError::Malformed("setitem target is not a dict".to_string()));
        }
        for (key, value) in pairs {
            let existing = match &self.heap[target] {
                Node::Dict(entries) => entries.iter().position(|&(k, _)| self.same_key(k, key)),
                _ => None,
            };
            if let Node::Dict(entries) = &mut self.heap[target] {
                match existing {
                    Some(index) => entries[index].1 = value,
                    None => entries.push((key, value)),
                }
            }
        }
        Ok(())
    }

    fn same_key(&self, a: NodeId, b: NodeId) -> bool {
        match (&self.heap[a], &self.heap[b]) {
            (Node::Text(x), Node::Text(y)) => x == y,
            (Node::Bytes(x), Node::Bytes(y)) => x == y,
            (Node::Int(x), Node::Int(y)) => x == y,
            (Node::Bool(x), Node::Bool(y)) => x == y,
            (Node::None, Node::None) => true,
            _ => a == b,
        }
    }

    /// Applies REDUCE / NEWOBJ for the globals this decoder understands.
    fn call(&mut self, callable: NodeId, args: NodeId) -> Result<Node> {
        let (module, name) = match &self.heap[callable] {
            Node::Global { module, name } => (module.clone(), name.clone()),
            _ => {
                return Err(PickleError::Malformed(
                    "reduce target is not a global".to_string(),
                ))
            }
        };
        let args = match &self.heap[args] {
            Node::Tuple(items) => items.clone(),
            _ => {
                return Err(PickleError::Malformed(
                    "reduce arguments are not a tuple".to_string(),
                ))
            }
        };
        log::trace!("Calling {}.{} with {} argument(s)", module, name, args.len());

        match (module.as_str(), name.as_str()) {
            (m, "_reconstruct") if is_numpy_module(m, "multiarray") => Ok(Node::PendingArray),
            (m, "scalar") if is_numpy_module(m, "multiarray") => self.numpy_scalar(&args),
            (m, "_frombuffer") if is_numpy_module(m, "numeric") => self.numpy_frombuffer(&args),
            ("numpy", "dtype") => {
                let spec = args
                    .first()
                    .and_then(|&id| self.node_text(id))
                    .ok_or_else(|| PickleError::InvalidArray("dtype without a type string".to_string()))?;
                Ok(Node::Dtype(Dtype::parse(&spec)?))
            }
            ("_codecs", "encode") => {
                let text = args.first().and_then(|&id| self.node_text(id)).unwrap_or_default();
                let encoding = args.get(1).and_then(|&id| self.node_text(id)).unwrap_or_default();
                let bytes = match encoding.to_ascii_lowercase().as_str() {
                    "latin1" | "latin-1" | "iso-8859-1" => latin1_bytes(&text)?,
                    _ => text.into_bytes(),
                };
                Ok(Node::Bytes(bytes))
            }
            ("__builtin__" | "builtins", "set" | "frozenset") => {
                let items = args.first().map(|&id| self.items_of(id)).unwrap_or_default();
                Ok(Node::Set(items))
            }
            ("__builtin__" | "builtins", "bytearray" | "bytes") => match args.first() {
                Some(&id) => match &self.heap[id] {
                    Node::List(items) => {
                        let bytes = items
                            .iter()
                            .map(|&item| self.node_int(item).map(|v| v as u8))
                            .collect::<Option<Vec<u8>>>()
                            .ok_or_else(|| PickleError::Malformed("invalid byte list".to_string()))?;
                        Ok(Node::Bytes(bytes))
                    }
                    _ => Ok(Node::Bytes(self.node_bytes(id)?)),
                },
                None => Ok(Node::Bytes(Vec::new())),
            },
            ("collections", "OrderedDict") => {
                let mut pairs = Vec::new();
                if let Some(&id) = args.first() {
                    for item in self.items_of(id) {
                        match self.items_of(item).as_slice() {
                            &[key, value] => pairs.push((key, value)),
                            _ => {
                                return Err(PickleError::Malformed(
                                    "OrderedDict item is not a pair".to_string(),
                                ))
                            }
                        }
                    }
                }
                Ok(Node::Dict(pairs))
            }
            _ => Ok(Node::Object {
                module,
                name,
                args,
                state: None,
            }),
        }
    }

    fn build(&mut self, target: NodeId, state: NodeId) -> Result<()> {
        match &self.heap[target] {
            Node::PendingArray => {
                let array = self.array_from_state(state)?;
                self.heap[target] = Node::Array(array);
            }
            Node::Dtype(dtype) => {
                // State is (version, byteorder, subarray, names, fields, ...)
                let mut dtype = *dtype;
                let order = self.items_of(state).get(1).and_then(|&id| self.node_text(id));
                if let Some(order) = order {
                    match order.as_str() {
                        ">" => dtype.big_endian = true,
                        "<" | "=" | "|" => dtype.big_endian = false,
                        _ => {}
                    }
                }
                self.heap[target] = Node::Dtype(dtype);
            }
            Node::Dict(_) => {
                let pairs = match &self.heap[state] {
                    Node::Dict(entries) => entries.clone(),
                    _ => {
                        return Err(PickleError::Malformed(
                            "dict state is not a dict".to_string(),
                        ))
                    }
                };
                self.set_items(target, pairs)?;
            }
            Node::Object { .. } => {
                if let Node::Object { state: slot, .. } = &mut self.heap[target] {
                    *slot = Some(state);
                }
            }
            _ => {
                return Err(PickleError::Malformed(
                    "build target cannot take state".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Builds an array from ndarray.__setstate__ arguments:
    /// `(version, shape, dtype, is_fortran, raw_data)`; version 0 omits the first entry.
    fn array_from_state(&self, state: NodeId) -> Result<NdArray> {
        let items = match &self.heap[state] {
            Node::Tuple(items) => items.as_slice(),
            _ => return Err(PickleError::InvalidArray("array state is not a tuple".to_string())),
        };
        let items = match items.len() {
            5 => &items[1..],
            4 => items,
            n => {
                return Err(PickleError::InvalidArray(format!(
                    "array state has {} entries",
                    n
                )))
            }
        };

        let shape = self.node_shape(items[0])?;
        let dtype = self.node_dtype(items[1])?;
        let fortran = self.node_int(items[2]).unwrap_or(0) != 0;
        if matches!(self.heap[items[3]], Node::List(_)) {
            return Err(PickleError::UnsupportedDtype("object".to_string()));
        }
        let raw = self.node_bytes(items[3])?;

        decode_array(dtype, &shape, &raw, fortran)
    }

    fn numpy_frombuffer(&self, args: &[NodeId]) -> Result<Node> {
        if args.len() < 3 {
            return Err(PickleError::InvalidArray("_frombuffer needs buffer, dtype and shape".to_string()));
        }
        let raw = self.node_bytes(args[0])?;
        let dtype = self.node_dtype(args[1])?;
        let shape = self.node_shape(args[2])?;
        let fortran = args
            .get(3)
            .and_then(|&id| self.node_text(id))
            .map(|order| order == "F")
            .unwrap_or(false);

        Ok(Node::Array(decode_array(dtype, &shape, &raw, fortran)?))
    }

    fn numpy_scalar(&self, args: &[NodeId]) -> Result<Node> {
        if args.len() < 2 {
            return Err(PickleError::InvalidArray("scalar needs dtype and data".to_string()));
        }
        let dtype = self.node_dtype(args[0])?;
        let raw = self.node_bytes(args[1])?;

        let node = match decode_array(dtype, &[], &raw, false)? {
            NdArray::Float(a) => Node::Float(a.iter().copied().next().unwrap_or_default()),
            NdArray::Int(a) => Node::Int(a.iter().copied().next().unwrap_or_default()),
            NdArray::Bool(a) => Node::Bool(a.iter().copied().next().unwrap_or_default()),
        };
        Ok(node)
    }
}

/// Converts the node graph left by the machine into an owned value tree.
///
/// Nodes referenced once are moved out of the heap, so array data is never
/// copied. Nodes shared through the memo are resolved once and cloned for
/// every further reference.
struct Resolver {
    heap: Vec<Node>,
    parents: Vec<u32>,
    active: Vec<bool>,
    cache: HashMap<NodeId, (Value, usize)>,
    copied: usize,
}

impl Resolver {
    fn new(heap: Vec<Node>, root: NodeId) -> Self {
        let parents = count_parents(&heap, root);
        let active = vec![false; heap.len()];
        Resolver {
            heap,
            parents,
            active,
            cache: HashMap::new(),
            copied: 0,
        }
    }

    fn run(mut self, root: NodeId) -> Result<Value> {
        self.resolve(root, 0).map(|(value, _)| value)
    }

    fn charge_copy(&mut self, size: usize) -> Result<()> {
        self.copied = self.copied.saturating_add(size);
        if self.copied > MAX_SHARED_VALUES {
            return Err(PickleError::Malformed(format!(
                "shared objects expand to more than {} values",
                MAX_SHARED_VALUES
            )));
        }
        Ok(())
    }

    /// Returns the value below `id` and the number of values it contains.
    fn resolve(&mut self, id: NodeId, depth: usize) -> Result<(Value, usize)> {
        if depth > MAX_DEPTH || self.active[id] {
            return Err(PickleError::Malformed(
                "structure is nested too deeply or recursive".to_string(),
            ));
        }
        if let Some(size) = self.cache.get(&id).map(|(_, size)| *size) {
            self.charge_copy(size)?;
            let value = self.cache[&id].0.clone();
            return Ok((value, size));
        }

        let shared = self.parents[id] > 1;
        let node = if shared {
            self.heap[id].clone()
        } else {
            std::mem::replace(&mut self.heap[id], Node::None)
        };

        self.active[id] = true;
        let result = self.resolve_node(node, depth);
        self.active[id] = false;

        let (value, size) = result?;
        if shared {
            self.cache.insert(id, (value.clone(), size));
        }
        Ok((value, size))
    }

    fn resolve_all(&mut self, ids: &[NodeId], depth: usize) -> Result<(Vec<Value>, usize)> {
        let mut values = Vec::with_capacity(ids.len());
        let mut size = 0;
        for &child in ids {
            let (value, child_size) = self.resolve(child, depth + 1)?;
            values.push(value);
            size += child_size;
        }
        Ok((values, size))
    }

    fn resolve_node(&mut self, node: Node, depth: usize) -> Result<(Value, usize)> {
        let mut size = 1;
        let value = match node {
            Node::None => Value::None,
            Node::Bool(v) => Value::Bool(v),
            Node::Int(v) => Value::Int(v),
            Node::Float(v) => Value::Float(v),
            Node::Text(s) => Value::Text(s),
            Node::Bytes(b) => Value::Bytes(b),
            Node::List(items) => {
                let (values, n) = self.resolve_all(&items, depth)?;
                size += n;
                Value::List(values)
            }
            Node::Tuple(items) => {
                let (values, n) = self.resolve_all(&items, depth)?;
                size += n;
                Value::Tuple(values)
            }
            Node::Set(items) => {
                let (values, n) = self.resolve_all(&items, depth)?;
                size += n;
                Value::Set(values)
            }
            Node::Dict(entries) => {
                let mut resolved = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let (key, key_size) = self.resolve(key, depth + 1)?;
                    let (value, value_size) = self.resolve(value, depth + 1)?;
                    size += key_size + value_size;
                    resolved.push((key, value));
                }
                Value::Dict(resolved)
            }
            Node::Global { module, name } => Value::Global { module, name },
            Node::Dtype(dtype) => Value::Dtype(dtype),
            Node::Array(array) => Value::Array(array),
            Node::PendingArray => {
                return Err(PickleError::InvalidArray(
                    "array was never given its state".to_string(),
                ))
            }
            Node::Object {
                module,
                name,
                args,
                state,
            } => {
                let (args, n) = self.resolve_all(&args, depth)?;
                size += n;
                let state = match state {
                    Some(state) => {
                        let (state, n) = self.resolve(state, depth + 1)?;
                        size += n;
                        Some(Box::new(state))
                    }
                    None => None,
                };
                Value::Object {
                    module,
                    name,
                    args,
                    state,
                }
            }
        };
        Ok((value, size))
    }
}

/// Counts how many references reach each node from `root`.
fn count_parents(heap: &[Node], root: NodeId) -> Vec<u32> {
    let mut parents = vec![0u32; heap.len()];
    let mut visited = vec![false; heap.len()];
    let mut pending = vec![root];
    let mut children = Vec::new();
    visited[root] = true;

    while let Some(id) = pending.pop() {
        children.clear();
        child_ids(&heap[id], &mut children);
        for &child in &children {
            parents[child] = parents[child].saturating_add(1);
            if !visited[child] {
                visited[child] = true;
                pending.push(child);
            }
        }
    }
    parents
}

fn child_ids(node: &Node, out: &mut Vec<NodeId>) {
    match node {
        Node::List(items) | Node::Tuple(items) | Node::Set(items) => out.extend_from_slice(items),
        Node::Dict(entries) => {
            for &(key, value) in entries {
                out.push(key);
                out.push(value);
            }
        }
        Node::Object { args, state, .. } => {
            out.extend_from_slice(args);
            out.extend(state.iter().copied());
        }
        _ => {}
    }
}

fn is_numpy_module(module: &str, submodule: &str) -> bool {
    match module.strip_prefix("numpy.") {
        Some(rest) => rest == format!("core.{}", submodule) || rest == format!("_core.{}", submodule),
        None => false,
    }
}

fn into_pairs(items: Vec<NodeId>) -> Result<Vec<(NodeId, NodeId)>> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Malformed("odd number of dict items".to_string()));
    }
    Ok(items.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

fn parse_int(text: &str) -> Result<i64> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| PickleError::Malformed(format!("invalid integer '{}'", text)))
}

fn parse_memo_key(text: &str) -> Result<u32> {
    text.trim()
        .parse::<u32>()
        .map_err(|_| PickleError::Malformed(format!("invalid memo key '{}'", text)))
}

/// Decodes a little-endian two's complement integer (LONG1 / LONG4).
fn decode_long(bytes: &[u8]) -> Result<i64> {
    if bytes.len() > 8 {
        return Err(PickleError::Malformed(
            "integer does not fit in 64 bits".to_string(),
        ));
    }
    let negative = bytes.last().map_or(false, |&b| b & 0x80 != 0);
    let mut buf = if negative { [0xff; 8] } else { [0; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

fn latin1_bytes(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(c as u32).map_err(|_| {
            PickleError::InvalidText(format!("character {:?} is outside Latin-1", c))
        }))
        .collect()
}

/// Parses the quoted argument of the STRING opcode (a Python `repr`).
fn unquote_string(line: &[u8]) -> Result<Vec<u8>> {
    let body = match line {
        [b'\'', body @ .., b'\''] | [b'"', body @ .., b'"'] => body,
        _ => {
            return Err(PickleError::Malformed(
                "STRING argument is not quoted".to_string(),
            ))
        }
    };

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let byte = body[i];
        i += 1;
        if byte != b'\\' {
            out.push(byte);
            continue;
        }

        let escape = *body
            .get(i)
            .ok_or_else(|| PickleError::Malformed("dangling escape".to_string()))?;
        i += 1;
        match escape {
            b'\\' | b'\'' | b'"' => out.push(escape),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\n' => {}
            b'x' => {
                let digits = body
                    .get(i..i + 2)
                    .ok_or_else(|| PickleError::Malformed("truncated \\x escape".to_string()))?;
                out.push(parse_hex(digits)? as u8);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = (escape - b'0') as u32;
                let mut taken = 1;
                while taken < 3 {
                    match body.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + (d - b'0') as u32;
                            i += 1;
                            taken += 1;
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// Decodes the argument of the UNICODE opcode (raw-unicode-escape).
fn decode_raw_unicode_escape(bytes: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let width = match (bytes[i], bytes.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            (byte, _) => {
                out.push(byte as char);
                i += 1;
                continue;
            }
        };
        let digits = bytes
            .get(i + 2..i + 2 + width)
            .ok_or_else(|| PickleError::InvalidText("truncated unicode escape".to_string()))?;
        let code = parse_hex(digits)?;
        let ch = char::from_u32(code)
            .ok_or_else(|| PickleError::InvalidText(format!("invalid code point {:#x}", code)))?;
        out.push(ch);
        i += 2 + width;
    }
    Ok(out)
}

fn parse_hex(digits: &[u8]) -> Result<u32> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| PickleError::Malformed("invalid hex escape".to_string()))
}

/// Interprets raw array bytes with the given dtype and shape.
fn decode_array(dtype: Dtype, shape: &[usize], raw: &[u8], fortran: bool) -> Result<NdArray> {
    let expected = shape
        .iter()
        .try_fold(dtype.size, |bytes, &dim| bytes.checked_mul(dim))
        .ok_or_else(|| {
            PickleError::InvalidArray(format!("shape {:?} is too large", shape))
        })?;
    if raw.len() != expected {
        return Err(PickleError::InvalidArray(format!(
            "expected {} bytes for shape {:?}, found {}",
            expected,
            shape,
            raw.len()
        )));
    }

    let array = match dtype.kind {
        DtypeKind::Float => {
            let values = if dtype.big_endian {
                read_floats::<BigEndian>(raw, dtype.size)
            } else {
                read_floats::<LittleEndian>(raw, dtype.size)
            };
            NdArray::Float(shape_values(shape, values, fortran)?)
        }
        DtypeKind::Int | DtypeKind::UInt => {
            let signed = dtype.kind == DtypeKind::Int;
            let values = if dtype.big_endian {
                read_ints::<BigEndian>(raw, dtype.size, signed)
            } else {
                read_ints::<LittleEndian>(raw, dtype.size, signed)
            };
            NdArray::Int(shape_values(shape, values, fortran)?)
        }
        DtypeKind::Bool => {
            let values = raw.iter().map(|&b| b != 0).collect();
            NdArray::Bool(shape_values(shape, values, fortran)?)
        }
    };
    Ok(array)
}

fn read_floats<B: ByteOrder>(raw: &[u8], size: usize) -> Vec<f64> {
    raw.chunks_exact(size)
        .map(|chunk| match size {
            4 => B::read_f32(chunk) as f64,
            _ => B::read_f64(chunk),
        })
        .collect()
}

fn read_ints<B: ByteOrder>(raw: &[u8], size: usize, signed: bool) -> Vec<i64> {
    raw.chunks_exact(size)
        .map(|chunk| match (size, signed) {
            (1, true) => chunk[0] as i8 as i64,
            (1, false) => chunk[0] as i64,
            (2, true) => B::read_i16(chunk) as i64,
            (2, false) => B::read_u16(chunk) as i64,
            (4, true) => B::read_i32(chunk) as i64,
            (4, false) => B::read_u32(chunk) as i64,
            (_, true) => B::read_i64(chunk),
            (_, false) => B::read_u64(chunk) as i64,
        })
        .collect()
}

fn shape_values<T: Clone>(shape: &[usize], values: Vec<T>, fortran: bool) -> Result<ArrayD<T>> {
    let dim = IxDyn(shape);
    let array = if fortran {
        ArrayD::from_shape_vec(dim.f(), values)
    } else {
        ArrayD::from_shape_vec(dim, values)
    }
    .map_err(|e| PickleError::InvalidArray(e.to_string()))?;

    if fortran {
        Ok(array.as_standard_layout().into_owned())
    } else {
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // numpy array pickled the way Python 2 does it (protocol 2)
    fn push_short_str(out: &mut Vec<u8>, s: &[u8]) {
        out.push(SHORT_BINSTRING);
        out.push(s.len() as u8);
        out.extend_from_slice(s);
    }

    fn push_dtype(out: &mut Vec<u8>, spec: &str, order: &str) {
        out.extend_from_slice(b"cnumpy\ndtype\n");
        push_short_str(out, spec.as_bytes());
        out.extend_from_slice(&[BININT1, 0, BININT1, 1, TUPLE3, REDUCE]);
        out.push(MARK);
        out.extend_from_slice(&[BININT1, 3]);
        push_short_str(out, order.as_bytes());
        out.extend_from_slice(&[NONE, NONE, NONE]);
        out.push(BININT);
        out.extend_from_slice(&(-1i32).to_le_bytes());
        out.push(BININT);
        out.extend_from_slice(&(-1i32).to_le_bytes());
        out.extend_from_slice(&[BININT1, 0, TUPLE, BUILD]);
    }

    fn push_array_header(out: &mut Vec<u8>, shape: &[u8]) {
        out.extend_from_slice(b"cnumpy.core.multiarray\n_reconstruct\n");
        out.extend_from_slice(b"cnumpy\nndarray\n");
        out.extend_from_slice(&[BININT1, 0, TUPLE1]);
        push_short_str(out, b"b");
        out.extend_from_slice(&[TUPLE3, REDUCE]);
        out.push(MARK);
        out.extend_from_slice(&[BININT1, 1]);
        out.push(MARK);
        for &dim in shape {
            out.extend_from_slice(&[BININT1, dim]);
        }
        out.push(TUPLE);
    }

    fn push_array_body(out: &mut Vec<u8>, fortran: bool, raw: &[u8]) {
        out.push(if fortran { NEWTRUE } else { NEWFALSE });
        out.push(BINSTRING);
        out.extend_from_slice(&(raw.len() as i32).to_le_bytes());
        out.extend_from_slice(raw);
        out.extend_from_slice(&[TUPLE, BUILD]);
    }

    #[test]
    fn test_latin1_string_keeps_code_points() {
        let bytes = b"\x80\x02U\x04caf\xe9q\x00.";
        let value = from_slice(bytes, TextDecoding::Latin1).unwrap();

        let text = value.as_str().unwrap();
        assert_eq!(text, "caf\u{e9}");
        assert_eq!(text.chars().last().map(|c| c as u32), Some(0xe9));
    }

    #[test]
    fn test_utf8_decoding_rejects_latin1_bytes() {
        let bytes = b"\x80\x02U\x04caf\xe9q\x00.";
        let result = from_slice(bytes, TextDecoding::Utf8);

        assert!(matches!(result, Err(PickleError::InvalidText(_))));
    }

    #[test]
    fn test_bytes_decoding_keeps_raw_bytes() {
        let bytes = b"\x80\x02U\x04caf\xe9q\x00.";
        let value = from_slice(bytes, TextDecoding::Bytes).unwrap();

        assert_eq!(value, Value::Bytes(b"caf\xe9".to_vec()));
    }

    #[test]
    fn test_protocol0_dict() {
        let bytes = b"(dp0\nS'a'\np1\nI1\nsS'b'\np2\nS'caf\\xe9'\np3\nsS'c'\np4\nL12L\nsS'd'\np5\nF2.5\nsS'e'\np6\nVna\\u00efve\np7\ns.";
        let value = from_slice(bytes, TextDecoding::Latin1).unwrap();

        assert_eq!(value.get("a"), Some(&Value::Int(1)));
        assert_eq!(value.get("b"), Some(&Value::Text("caf\u{e9}".to_string())));
        assert_eq!(value.get("c"), Some(&Value::Int(12)));
        assert_eq!(value.get("d"), Some(&Value::Float(2.5)));
        assert_eq!(value.get("e"), Some(&Value::Text("na\u{ef}ve".to_string())));
        assert_eq!(value.get("missing"), None);
    }

    #[test]
    fn test_memoized_dict_is_shared() {
        // {'x': d, 'y': d} where d is filled after being memoized
        let mut bytes = vec![PROTO, 2, EMPTY_DICT, BINPUT, 0, MARK];
        push_short_str(&mut bytes, b"x");
        bytes.extend_from_slice(&[EMPTY_DICT, BINPUT, 1]);
        push_short_str(&mut bytes, b"k");
        bytes.extend_from_slice(&[BININT1, 7, SETITEM]);
        push_short_str(&mut bytes, b"y");
        bytes.extend_from_slice(&[BINGET, 1, SETITEMS, STOP]);

        let value = from_slice(&bytes, TextDecoding::Latin1).unwrap();
        let x = value.get("x").unwrap();
        let y = value.get("y").unwrap();
        assert_eq!(x.get("k"), Some(&Value::Int(7)));
        assert_eq!(x, y);
    }

    #[test]
    fn test_numpy_float_array() {
        let raw: Vec<u8> = [1.5f64, -2.0, 3.25]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut bytes = vec![PROTO, 2];
        push_array_header(&mut bytes, &[3]);
        push_dtype(&mut bytes, "f8", "<");
        push_array_body(&mut bytes, false, &raw);
        bytes.push(STOP);

        let value = from_slice(&bytes, TextDecoding::Latin1).unwrap();
        match value {
            Value::Array(NdArray::Float(array)) => {
                assert_eq!(array.shape(), &[3]);
                assert_eq!(array.iter().copied().collect::<Vec<_>>(), vec![1.5, -2.0, 3.25]);
            }
            other => panic!("expected float array, got {:?}", other),
        }
    }

    #[test]
    fn test_memoized_dtype_keeps_byte_order() {
        let first: Vec<u8> = [1i32, 2].iter().flat_map(|v| v.to_be_bytes()).collect();
        let second: Vec<u8> = [3i32, 4].iter().flat_map(|v| v.to_be_bytes()).collect();

        let mut bytes = vec![PROTO, 2, MARK];
        push_array_header(&mut bytes, &[2]);
        push_dtype(&mut bytes, "i4", ">");
        bytes.extend_from_slice(&[BINPUT, 9]);
        push_array_body(&mut bytes, false, &first);
        push_array_header(&mut bytes, &[2]);
        bytes.extend_from_slice(&[BINGET, 9]);
        push_array_body(&mut bytes, false, &second);
        bytes.extend_from_slice(&[LIST, STOP]);

        let value = from_slice(&bytes, TextDecoding::Latin1).unwrap();
        let arrays: Vec<Vec<i64>> = match value {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Array(array) => array.into_i64().iter().copied().collect(),
                    other => panic!("expected array, got {:?}", other),
                })
                .collect(),
            other => panic!("expected list, got {:?}", other),
        };
        assert_eq!(arrays, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_fortran_array_is_returned_row_major() {
        // Column-major storage of [[1, 3, 5], [2, 4, 6]]
        let raw: Vec<u8> = (1..=6i64).flat_map(|v| v.to_le_bytes()).collect();
        let mut bytes = vec![PROTO, 2];
        push_array_header(&mut bytes, &[2, 3]);
        push_dtype(&mut bytes, "i8", "<");
        push_array_body(&mut bytes, true, &raw);
        bytes.push(STOP);

        let value = from_slice(&bytes, TextDecoding::Latin1).unwrap();
        match value {
            Value::Array(NdArray::Int(array)) => {
                assert_eq!(array.shape(), &[2, 3]);
                assert_eq!(array.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5, 2, 4, 6]);
            }
            other => panic!("expected int array, got {:?}", other),
        }
    }

    #[test]
    fn test_array_with_wrong_byte_count() {
        let raw = vec![0u8; 12];
        let mut bytes = vec![PROTO, 2];
        push_array_header(&mut bytes, &[2]);
        push_dtype(&mut bytes, "f8", "<");
        push_array_body(&mut bytes, false, &raw);
        bytes.push(STOP);

        let result = from_slice(&bytes, TextDecoding::Latin1);
        assert!(matches!(result, Err(PickleError::InvalidArray(_))));
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!(
            Dtype::parse("<f4").unwrap(),
            Dtype { kind: DtypeKind::Float, size: 4, big_endian: false }
        );
        assert_eq!(
            Dtype::parse(">u2").unwrap(),
            Dtype { kind: DtypeKind::UInt, size: 2, big_endian: true }
        );
        assert_eq!(Dtype::parse("?").unwrap().kind, DtypeKind::Bool);
        assert!(matches!(Dtype::parse("f2"), Err(PickleError::UnsupportedDtype(_))));
        assert!(matches!(Dtype::parse("O8"), Err(PickleError::UnsupportedDtype(_))));
        assert!(matches!(Dtype::parse("U5"), Err(PickleError::UnsupportedDtype(_))));
    }

    #[test]
    fn test_truncated_stream() {
        let result = from_slice(b"\x80\x02U\x08abc", TextDecoding::Latin1);
        assert!(matches!(result, Err(PickleError::UnexpectedEof)));

        let result = from_slice(b"\x80\x02K\x01", TextDecoding::Latin1);
        assert!(matches!(result, Err(PickleError::UnexpectedEof)));
    }

    #[test]
    fn test_unknown_opcode() {
        let result = from_slice(b"\x80\x02\xff.", TextDecoding::Latin1);
        assert!(matches!(result, Err(PickleError::UnknownOpcode(0xff))));
    }

    #[test]
    fn test_tuple_cannot_reach_below_mark() {
        let bytes = [PROTO, 2, BININT1, 1, BININT1, 2, MARK, TUPLE2, TUPLE, STOP];
        let result = from_slice(&bytes, TextDecoding::Latin1);

        assert!(matches!(result, Err(PickleError::StackUnderflow(TUPLE2))));
    }

    #[test]
    fn test_tuple_inside_mark_frame() {
        let bytes = [PROTO, 2, MARK, BININT1, 1, BININT1, 2, TUPLE2, TUPLE, STOP];
        let value = from_slice(&bytes, TextDecoding::Latin1).unwrap();

        assert_eq!(
            value,
            Value::Tuple(vec![Value::Tuple(vec![Value::Int(1), Value::Int(2)])])
        );
    }

    #[test]
    fn test_oversized_array_shape_is_rejected() {
        // LONG1 encoding of 2^40
        let dim = [LONG1, 6, 0, 0, 0, 0, 0, 1];
        let mut bytes = vec![PROTO, 2];
        bytes.extend_from_slice(b"cnumpy.core.multiarray\n_reconstruct\n");
        bytes.extend_from_slice(b"cnumpy\nndarray\n");
        bytes.extend_from_slice(&[BININT1, 0, TUPLE1]);
        push_short_str(&mut bytes, b"b");
        bytes.extend_from_slice(&[TUPLE3, REDUCE, MARK, BININT1, 1]);
        bytes.extend_from_slice(&dim);
        bytes.extend_from_slice(&dim);
        bytes.push(TUPLE2);
        push_dtype(&mut bytes, "f8", "<");
        push_array_body(&mut bytes, false, b"");
        bytes.push(STOP);

        let result = from_slice(&bytes, TextDecoding::Latin1);
        assert!(matches!(result, Err(PickleError::InvalidArray(_))));
    }

    #[test]
    fn test_memoized_array_appears_at_every_reference() {
        let raw: Vec<u8> = [0.5f64, 0.25].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut bytes = vec![PROTO, 2, EMPTY_LIST, MARK];
        push_array_header(&mut bytes, &[2]);
        push_dtype(&mut bytes, "f8", "<");
        push_array_body(&mut bytes, false, &raw);
        bytes.extend_from_slice(&[BINPUT, 0, BINGET, 0, APPENDS, STOP]);

        let value = from_slice(&bytes, TextDecoding::Latin1).unwrap();
        match value {
            Value::List(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0], items[1]);
                assert_eq!(items[0].type_name(), "array");
            }
            other => panic!("expected list, got {:?}", other),
        }
    }

    // levels[i] = [levels[i - 1], levels[i - 1]], each memoized
    fn shared_lists(levels: u8) -> Vec<u8> {
        let mut bytes = vec![PROTO, 2, EMPTY_LIST, BINPUT, 0];
        for level in 1..=levels {
            bytes.extend_from_slice(&[EMPTY_LIST, BINPUT, level, MARK]);
            bytes.extend_from_slice(&[BINGET, level - 1, BINGET, level - 1, APPENDS]);
        }
        bytes.push(STOP);
        bytes
    }

    #[test]
    fn test_shared_lists_are_expanded() {
        let value = from_slice(&shared_lists(2), TextDecoding::Latin1).unwrap();

        let leaf = Value::List(Vec::new());
        let middle = Value::List(vec![leaf.clone(), leaf]);
        assert_eq!(value, Value::List(vec![middle.clone(), middle]));
    }

    #[test]
    fn test_shared_list_expansion_is_bounded() {
        let result = from_slice(&shared_lists(40), TextDecoding::Latin1);
        assert!(matches!(result, Err(PickleError::Malformed(_))));
    }

    #[test]
    fn test_self_referencing_list_is_rejected() {
        let bytes = [PROTO, 2, EMPTY_LIST, BINPUT, 0, BINGET, 0, APPEND, STOP];
        let result = from_slice(&bytes, TextDecoding::Latin1);

        assert!(matches!(result, Err(PickleError::Malformed(_))));
    }

    #[test]
    fn test_long_and_bool_opcodes() {
        let bytes = [
            PROTO, 2, MARK, LONG1, 2, 0x00, 0x80, LONG1, 1, 0xff, NEWTRUE, b'I', b'0', b'0', b'\n',
            TUPLE, STOP,
        ];
        let value = from_slice(&bytes, TextDecoding::Latin1).unwrap();

        assert_eq!(
            value,
            Value::Tuple(vec![
                Value::Int(-32768),
                Value::Int(-1),
                Value::Bool(true),
                Value::Bool(false),
            ])
        );
    }

    #[test]
    fn test_unknown_global_becomes_object() {
        let mut bytes = b"\x80\x02cdatetime\ndate\n".to_vec();
        push_short_str(&mut bytes, b"\x07\xe6\x01\x02");
        bytes.extend_from_slice(&[TUPLE1, REDUCE, STOP]);

        let value = from_slice(&bytes, TextDecoding::Latin1).unwrap();
        match value {
            Value::Object { module, name, args, state } => {
                assert_eq!(module, "datetime");
                assert_eq!(name, "date");
                assert_eq!(args.len(), 1);
                assert!(state.is_none());
            }
            other => panic!("expected object, got {:?}", other),
        }
    }
}
