//! A minimal, read-mostly decoder/encoder for the small subset of the Python
//! pickle protocol that `google-auth`'s `Credentials.__reduce__` actually
//! emits. This is not a general pickle implementation: unsupported opcodes
//! raise rather than silently mis-parse, and the value model only needs
//! enough shape (dicts, strings, None, bools, ints, small objects of one
//! constructor call) to recover `token` / `refresh_token` / `token_uri` /
//! `client_id` / `client_secret` / `scopes` / `expiry` out of a `Credentials`
//! instance's `__dict__`.

use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum PickleValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<PickleValue>),
    Tuple(Vec<PickleValue>),
    Dict(HashMap<String, PickleValue>),
    /// Result of a GLOBAL+REDUCE/BUILD pair: the class path plus its state
    /// dict, as for `google.oauth2.credentials.Credentials(...)`.
    Object {
        class_path: String,
        state: Box<PickleValue>,
    },
}

impl PickleValue {
    pub fn as_dict(&self) -> Option<&HashMap<String, PickleValue>> {
        match self {
            PickleValue::Dict(m) => Some(m),
            PickleValue::Object { state, .. } => state.as_dict(),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.as_dict()?.get(key)? {
            PickleValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.as_dict()?.get(key)? {
            PickleValue::List(items) | PickleValue::Tuple(items) => Some(
                items
                    .iter()
                    .filter_map(|v| match v {
                        PickleValue::Str(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        }
    }
}

const PROTO: u8 = 0x80;
const FRAME: u8 = 0x95;
const STOP: u8 = b'.';
const MARK: u8 = b'(';
const EMPTY_DICT: u8 = b'}';
const EMPTY_LIST: u8 = b']';
const EMPTY_TUPLE: u8 = b')';
const NONE: u8 = b'N';
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const LONG1: u8 = 0x8a;
const BINFLOAT: u8 = b'G';
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE: u8 = b'X';
const BINUNICODE8: u8 = 0x8d;
const SHORT_BINBYTES: u8 = b'C';
const BINBYTES: u8 = b'B';
const SETITEM: u8 = b's';
const SETITEMS: u8 = b'u';
const APPEND: u8 = b'a';
const APPENDS: u8 = b'e';
const TUPLE: u8 = b't';
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const MEMOIZE: u8 = 0x94;
const GLOBAL: u8 = b'c';
const STACK_GLOBAL: u8 = 0x93;
const REDUCE: u8 = b'R';
const BUILD: u8 = b'b';
const NEWOBJ: u8 = 0x81;

/// Encode a flat string-keyed dict as a protocol-2 pickle stream. This is
/// deliberately narrower than `decode`: it only emits the opcodes needed to
/// round-trip the scalar fields this store reads back out of a `Credentials`
/// object, so a refreshed credential stays a valid pickle file for any other
/// reader of the same cache.
pub fn encode_flat_dict(fields: &[(&str, PickleValue)]) -> Vec<u8> {
    let mut out = vec![PROTO, 2, EMPTY_DICT];
    if !fields.is_empty() {
        out.push(MARK);
        for (key, value) in fields {
            encode_str(&mut out, key);
            encode_value(&mut out, value);
        }
        out.push(SETITEMS);
    }
    out.push(STOP);
    out
}

fn encode_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    if bytes.len() < 256 {
        out.push(SHORT_BINUNICODE);
        out.push(bytes.len() as u8);
    } else {
        out.push(BINUNICODE);
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(bytes);
}

fn encode_value(out: &mut Vec<u8>, value: &PickleValue) {
    match value {
        PickleValue::None => out.push(NONE),
        PickleValue::Bool(true) => out.push(NEWTRUE),
        PickleValue::Bool(false) => out.push(NEWFALSE),
        PickleValue::Str(s) => encode_str(out, s),
        PickleValue::Int(i) if *i >= i32::MIN as i64 && *i <= i32::MAX as i64 => {
            out.push(BININT);
            out.extend_from_slice(&(*i as i32).to_le_bytes());
        }
        PickleValue::Int(i) => encode_str(out, &i.to_string()),
        PickleValue::Float(f) => {
            out.push(BINFLOAT);
            out.extend_from_slice(&f.to_be_bytes());
        }
        other => encode_str(out, &format!("{other:?}")),
    }
}

/// Decode a pickle byte stream into a single top-level [`PickleValue`].
pub fn decode(bytes: &[u8]) -> Result<PickleValue> {
    let mut cur = Cursor { buf: bytes, pos: 0 };
    let mut stack: Vec<PickleValue> = Vec::new();
    let mut marks: Vec<usize> = Vec::new();
    let mut memo: HashMap<u32, PickleValue> = HashMap::new();

    loop {
        let op = cur.u8()?;
        match op {
            PROTO => {
                cur.u8()?;
            }
            FRAME => {
                cur.take(8)?;
            }
            MARK => marks.push(stack.len()),
            STOP => break,
            NONE => stack.push(PickleValue::None),
            NEWTRUE => stack.push(PickleValue::Bool(true)),
            NEWFALSE => stack.push(PickleValue::Bool(false)),
            BININT => stack.push(PickleValue::Int(cur.i32()? as i64)),
            BININT1 => stack.push(PickleValue::Int(cur.u8()? as i64)),
            BININT2 => stack.push(PickleValue::Int(cur.u16()? as i64)),
            LONG1 => {
                let n = cur.u8()? as usize;
                let b = cur.take(n)?;
                stack.push(PickleValue::Int(decode_long1(b)));
            }
            BINFLOAT => stack.push(PickleValue::Float(cur.f64_be()?)),
            SHORT_BINUNICODE => {
                let n = cur.u8()? as usize;
                stack.push(PickleValue::Str(cur.utf8(n)?));
            }
            BINUNICODE => {
                let n = cur.u32()? as usize;
                stack.push(PickleValue::Str(cur.utf8(n)?));
            }
            BINUNICODE8 => {
                let n = cur.u64()? as usize;
                stack.push(PickleValue::Str(cur.utf8(n)?));
            }
            SHORT_BINBYTES => {
                let n = cur.u8()? as usize;
                stack.push(PickleValue::Bytes(cur.take(n)?.to_vec()));
            }
            BINBYTES => {
                let n = cur.u32()? as usize;
                stack.push(PickleValue::Bytes(cur.take(n)?.to_vec()));
            }
            EMPTY_DICT => stack.push(PickleValue::Dict(HashMap::new())),
            EMPTY_LIST => stack.push(PickleValue::List(Vec::new())),
            EMPTY_TUPLE => stack.push(PickleValue::Tuple(Vec::new())),
            SETITEM => {
                let v = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at SETITEM"))?;
                let k = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at SETITEM"))?;
                let dict = stack
                    .last_mut()
                    .ok_or_else(|| anyhow!("pickle: no dict for SETITEM"))?;
                insert_pair(dict, k, v)?;
            }
            SETITEMS => {
                let mark = marks.pop().ok_or_else(|| anyhow!("pickle: unmatched SETITEMS"))?;
                let items: Vec<PickleValue> = stack.drain(mark..).collect();
                let dict = stack
                    .last_mut()
                    .ok_or_else(|| anyhow!("pickle: no dict for SETITEMS"))?;
                for pair in items.chunks(2) {
                    if let [k, v] = pair {
                        insert_pair(dict, k.clone(), v.clone())?;
                    }
                }
            }
            APPEND => {
                let v = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at APPEND"))?;
                match stack.last_mut() {
                    Some(PickleValue::List(l)) => l.push(v),
                    _ => bail!("pickle: APPEND target not a list"),
                }
            }
            APPENDS => {
                let mark = marks.pop().ok_or_else(|| anyhow!("pickle: unmatched APPENDS"))?;
                let items: Vec<PickleValue> = stack.drain(mark..).collect();
                match stack.last_mut() {
                    Some(PickleValue::List(l)) => l.extend(items),
                    _ => bail!("pickle: APPENDS target not a list"),
                }
            }
            TUPLE => {
                let mark = marks.pop().ok_or_else(|| anyhow!("pickle: unmatched TUPLE"))?;
                let items: Vec<PickleValue> = stack.drain(mark..).collect();
                stack.push(PickleValue::Tuple(items));
            }
            TUPLE1 => {
                let a = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at TUPLE1"))?;
                stack.push(PickleValue::Tuple(vec![a]));
            }
            TUPLE2 => {
                let b = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at TUPLE2"))?;
                let a = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at TUPLE2"))?;
                stack.push(PickleValue::Tuple(vec![a, b]));
            }
            TUPLE3 => {
                let c = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at TUPLE3"))?;
                let b = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at TUPLE3"))?;
                let a = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at TUPLE3"))?;
                stack.push(PickleValue::Tuple(vec![a, b, c]));
            }
            BINGET => {
                let idx = cur.u8()? as u32;
                stack.push(memo.get(&idx).cloned().ok_or_else(|| anyhow!("pickle: bad memo ref"))?);
            }
            LONG_BINGET => {
                let idx = cur.u32()?;
                stack.push(memo.get(&idx).cloned().ok_or_else(|| anyhow!("pickle: bad memo ref"))?);
            }
            BINPUT => {
                let idx = cur.u8()? as u32;
                memo.insert(idx, stack.last().cloned().ok_or_else(|| anyhow!("pickle: empty stack at BINPUT"))?);
            }
            LONG_BINPUT => {
                let idx = cur.u32()?;
                memo.insert(idx, stack.last().cloned().ok_or_else(|| anyhow!("pickle: empty stack at LONG_BINPUT"))?);
            }
            MEMOIZE => {
                let idx = memo.len() as u32;
                memo.insert(idx, stack.last().cloned().ok_or_else(|| anyhow!("pickle: empty stack at MEMOIZE"))?);
            }
            GLOBAL => {
                let module = cur.line()?;
                let name = cur.line()?;
                stack.push(PickleValue::Str(format!("{module}.{name}")));
            }
            STACK_GLOBAL => {
                let name = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at STACK_GLOBAL"))?;
                let module = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at STACK_GLOBAL"))?;
                let (PickleValue::Str(m), PickleValue::Str(n)) = (module, name) else {
                    bail!("pickle: STACK_GLOBAL expects two strings");
                };
                stack.push(PickleValue::Str(format!("{m}.{n}")));
            }
            NEWOBJ => {
                let _args = stack.pop();
                let class_path = match stack.pop() {
                    Some(PickleValue::Str(s)) => s,
                    _ => bail!("pickle: NEWOBJ expects a class path"),
                };
                stack.push(PickleValue::Object {
                    class_path,
                    state: Box::new(PickleValue::Dict(HashMap::new())),
                });
            }
            REDUCE => {
                let args = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at REDUCE"))?;
                let callable = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at REDUCE"))?;
                let class_path = match callable {
                    PickleValue::Str(s) => s,
                    _ => "<reduce>".to_string(),
                };
                stack.push(PickleValue::Object {
                    class_path,
                    state: Box::new(args),
                });
            }
            BUILD => {
                let state = stack.pop().ok_or_else(|| anyhow!("pickle: empty stack at BUILD"))?;
                match stack.last_mut() {
                    Some(PickleValue::Object { state: s, .. }) => *s = Box::new(state),
                    _ => bail!("pickle: BUILD target is not an object"),
                }
            }
            other => bail!("pickle: unsupported opcode 0x{:02x}", other),
        }
    }

    stack.pop().ok_or_else(|| anyhow!("pickle: empty result"))
}

fn insert_pair(container: &mut PickleValue, key: PickleValue, value: PickleValue) -> Result<()> {
    let key = match key {
        PickleValue::Str(s) => s,
        other => format!("{other:?}"),
    };
    match container {
        PickleValue::Dict(d) => {
            d.insert(key, value);
            Ok(())
        }
        _ => bail!("pickle: SETITEM target is not a dict"),
    }
}

fn decode_long1(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }
    let top_bit = 1i64 << (bytes.len() * 8 - 1);
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        value -= top_bit * 2;
    }
    value
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            bail!("pickle: unexpected end of stream");
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64_be(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn utf8(&mut self, n: usize) -> Result<String> {
        Ok(String::from_utf8_lossy(self.take(n)?).into_owned())
    }

    /// A newline-terminated ASCII line, as used by GLOBAL's two string args.
    fn line(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != b'\n' {
            self.pos += 1;
        }
        if self.pos >= self.buf.len() {
            bail!("pickle: unterminated GLOBAL line");
        }
        let s = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_dict_of_scalars() {
        // Equivalent to pickle.dumps({"token": "abc", "expiry": None}, protocol=2),
        // built by hand: EMPTY_DICT, MARK, short strings, SETITEMS, STOP.
        let mut bytes = vec![PROTO, 2, EMPTY_DICT, MARK];
        bytes.push(SHORT_BINUNICODE);
        bytes.push(5);
        bytes.extend_from_slice(b"token");
        bytes.push(SHORT_BINUNICODE);
        bytes.push(3);
        bytes.extend_from_slice(b"abc");
        bytes.push(SHORT_BINUNICODE);
        bytes.push(6);
        bytes.extend_from_slice(b"expiry");
        bytes.push(NONE);
        bytes.push(SETITEMS);
        bytes.push(STOP);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.get_str("token").as_deref(), Some("abc"));
        assert_eq!(decoded.as_dict().unwrap().get("expiry"), Some(&PickleValue::None));
    }
}
