//! A minimal NBT value model and binary codec, covering what chat
//! components need on the 1.20.3+ wire.
//!
//! Values are encoded in the *network* variant: the root is a bare tag
//! byte followed by an unnamed payload.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{bail, ensure};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Maximum recursion depth to prevent overflowing the call stack.
const MAX_DEPTH: usize = 512;

/// An NBT compound: string keys to values, sorted for deterministic
/// output.
pub type Compound = BTreeMap<String, Value>;

#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<i8>),
    String(String),
    List(Vec<Value>),
    Compound(Compound),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::Byte(_) => 1,
            Value::Short(_) => 2,
            Value::Int(_) => 3,
            Value::Long(_) => 4,
            Value::Float(_) => 5,
            Value::Double(_) => 6,
            Value::ByteArray(_) => 7,
            Value::String(_) => 8,
            Value::List(_) => 9,
            Value::Compound(_) => 10,
            Value::IntArray(_) => 11,
            Value::LongArray(_) => 12,
        }
    }
}

/// Encodes `value` as a network NBT document (unnamed root).
pub fn to_binary(value: &Value, mut w: impl Write) -> anyhow::Result<()> {
    w.write_u8(value.tag())?;
    encode_payload(value, &mut w)
}

fn encode_payload(value: &Value, w: &mut impl Write) -> anyhow::Result<()> {
    match value {
        Value::Byte(v) => w.write_i8(*v)?,
        Value::Short(v) => w.write_i16::<BigEndian>(*v)?,
        Value::Int(v) => w.write_i32::<BigEndian>(*v)?,
        Value::Long(v) => w.write_i64::<BigEndian>(*v)?,
        Value::Float(v) => w.write_f32::<BigEndian>(*v)?,
        Value::Double(v) => w.write_f64::<BigEndian>(*v)?,
        Value::ByteArray(v) => {
            w.write_i32::<BigEndian>(v.len() as i32)?;
            for b in v {
                w.write_i8(*b)?;
            }
        }
        Value::String(v) => encode_string(v, w)?,
        Value::List(v) => {
            let elem_tag = v.first().map_or(0, Value::tag);

            for elem in v {
                ensure!(
                    elem.tag() == elem_tag,
                    "list elements have differing tags ({} and {})",
                    elem_tag,
                    elem.tag()
                );
            }

            w.write_u8(elem_tag)?;
            w.write_i32::<BigEndian>(v.len() as i32)?;
            for elem in v {
                encode_payload(elem, w)?;
            }
        }
        Value::Compound(v) => {
            for (name, value) in v {
                w.write_u8(value.tag())?;
                encode_string(name, w)?;
                encode_payload(value, w)?;
            }
            w.write_u8(0)?;
        }
        Value::IntArray(v) => {
            w.write_i32::<BigEndian>(v.len() as i32)?;
            for n in v {
                w.write_i32::<BigEndian>(*n)?;
            }
        }
        Value::LongArray(v) => {
            w.write_i32::<BigEndian>(v.len() as i32)?;
            for n in v {
                w.write_i64::<BigEndian>(*n)?;
            }
        }
    }

    Ok(())
}

fn encode_string(s: &str, w: &mut impl Write) -> anyhow::Result<()> {
    ensure!(
        u16::try_from(s.len()).is_ok(),
        "string of {} bytes exceeds NBT's length prefix",
        s.len()
    );

    w.write_u16::<BigEndian>(s.len() as u16)?;
    Ok(w.write_all(s.as_bytes())?)
}

/// Decodes a network NBT document (unnamed root) from the slice.
pub fn from_binary(r: &mut &[u8]) -> anyhow::Result<Value> {
    let tag = r.read_u8()?;
    ensure!(tag != 0, "root value has the end tag");
    decode_payload(r, tag, 0)
}

fn decode_payload(r: &mut &[u8], tag: u8, depth: usize) -> anyhow::Result<Value> {
    ensure!(depth < MAX_DEPTH, "reached maximum recursion depth");

    Ok(match tag {
        1 => Value::Byte(r.read_i8()?),
        2 => Value::Short(r.read_i16::<BigEndian>()?),
        3 => Value::Int(r.read_i32::<BigEndian>()?),
        4 => Value::Long(r.read_i64::<BigEndian>()?),
        5 => Value::Float(r.read_f32::<BigEndian>()?),
        6 => Value::Double(r.read_f64::<BigEndian>()?),
        7 => {
            let len = checked_len(r, 1)?;
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(r.read_i8()?);
            }
            Value::ByteArray(v)
        }
        8 => Value::String(decode_string(r)?),
        9 => {
            let elem_tag = r.read_u8()?;
            let len = r.read_i32::<BigEndian>()?;
            ensure!(len >= 0, "list with negative length");
            ensure!(
                elem_tag != 0 || len == 0,
                "list of end tags with nonzero length"
            );

            let mut v = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                v.push(decode_payload(r, elem_tag, depth + 1)?);
            }
            Value::List(v)
        }
        10 => {
            let mut compound = Compound::new();
            loop {
                let tag = r.read_u8()?;
                if tag == 0 {
                    break;
                }
                let name = decode_string(r)?;
                compound.insert(name, decode_payload(r, tag, depth + 1)?);
            }
            Value::Compound(compound)
        }
        11 => {
            let len = checked_len(r, 4)?;
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(r.read_i32::<BigEndian>()?);
            }
            Value::IntArray(v)
        }
        12 => {
            let len = checked_len(r, 8)?;
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(r.read_i64::<BigEndian>()?);
            }
            Value::LongArray(v)
        }
        tag => bail!("invalid tag byte of {tag:#x}"),
    })
}

fn checked_len(r: &mut &[u8], elem_size: usize) -> anyhow::Result<usize> {
    let len = r.read_i32::<BigEndian>()?;
    ensure!(len >= 0, "array with negative length");
    let len = len as usize;
    ensure!(
        len.saturating_mul(elem_size) <= r.len(),
        "array of {len} elements overruns the input"
    );
    Ok(len)
}

fn decode_string(r: &mut &[u8]) -> anyhow::Result<String> {
    let len = r.read_u16::<BigEndian>()? as usize;
    ensure!(
        len <= r.len(),
        "string of {len} bytes overruns the input ({} remaining)",
        r.len()
    );

    let (bytes, remaining) = r.split_at(len);
    let s = std::str::from_utf8(bytes)?.to_owned();
    *r = remaining;

    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        let mut inner = Compound::new();
        inner.insert("text".into(), Value::String("hello".into()));
        inner.insert("bold".into(), Value::Byte(1));

        let mut root = Compound::new();
        root.insert("text".into(), Value::String("" .into()));
        root.insert(
            "extra".into(),
            Value::List(vec![Value::Compound(inner)]),
        );
        root.insert("ids".into(), Value::IntArray(vec![1, 2, 3]));

        Value::Compound(root)
    }

    #[test]
    fn binary_round_trip() {
        let value = sample();

        let mut buf = vec![];
        to_binary(&value, &mut buf).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(from_binary(&mut r).unwrap(), value);
        assert!(r.is_empty());
    }

    #[test]
    fn heterogeneous_list_rejected() {
        let bad = Value::List(vec![Value::Byte(1), Value::Int(2)]);

        let mut buf = vec![];
        assert!(to_binary(&bad, &mut buf).is_err());
    }

    #[test]
    fn truncated_input_rejected() {
        let mut buf = vec![];
        to_binary(&sample(), &mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        assert!(from_binary(&mut buf.as_slice()).is_err());
    }
}
