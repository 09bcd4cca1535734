//! ABI-driven serialization.
//!
//! An ABI maps textual type definitions onto a deterministic binary
//! encoding. Supported shapes: integer widths 8 through 128, varints,
//! floats, bool, bytes, strings, 32-byte checksums, time points,
//! names, signatures and keys, plus aliases, fixed and dynamic
//! arrays (`[N]`/`[]`), optionals (`?`), tagged variants, structs
//! with single inheritance, and binary extension fields (`$`) that
//! may be omitted only at the end of the stream when every later
//! field is also an extension.
//!
//! Circular alias or struct definitions are rejected when the ABI is
//! loaded, and packing/unpacking caps its recursion depth. An empty
//! struct at the top level decodes to an empty object.

use {
  crate::primitives::TimePoint,
  serde::{Deserialize, Serialize},
  serde_json::{json, Map, Value},
  std::collections::{HashMap, HashSet},
  thiserror::Error,
};

pub const MAX_RECURSION_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum AbiError {
  #[error("duplicate abi type definition {0}")]
  DuplicateType(String),

  #[error("circular reference in type {0}")]
  CircularReference(String),

  #[error("unknown type {0}")]
  UnknownType(String),

  #[error("recursion depth exceeded")]
  RecursionDepth,

  #[error("stream ended while unpacking {0}")]
  StreamEnded(String),

  #[error(
    "field {0} lacks a binary extension marker but follows one in struct {1}"
  )]
  NonTrailingExtension(String, String),

  #[error("missing field {0} while packing struct {1}")]
  MissingField(String, String),

  #[error("unexpected value {0} for type {1}")]
  UnexpectedValue(String, String),

  #[error("invalid variant tag {0} for {1}")]
  InvalidVariantTag(u64, String),

  #[error("trailing {0} byte(s) after unpacking")]
  TrailingBytes(usize),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypeDef {
  pub new_type_name: String,
  #[serde(rename = "type")]
  pub type_: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDef {
  pub name: String,
  #[serde(rename = "type")]
  pub type_: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StructDef {
  pub name: String,
  #[serde(default)]
  pub base: String,
  #[serde(default)]
  pub fields: Vec<FieldDef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariantDef {
  pub name: String,
  pub types: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AbiDef {
  #[serde(default)]
  pub types: Vec<TypeDef>,
  #[serde(default)]
  pub structs: Vec<StructDef>,
  #[serde(default)]
  pub variants: Vec<VariantDef>,
}

/// A validated ABI ready to pack and unpack values.
pub struct AbiSerializer {
  typedefs: HashMap<String, String>,
  structs: HashMap<String, StructDef>,
  variants: HashMap<String, VariantDef>,
}

struct ReadStream<'a> {
  bytes: &'a [u8],
  position: usize,
}

impl<'a> ReadStream<'a> {
  fn remaining(&self) -> usize {
    self.bytes.len() - self.position
  }

  fn take(&mut self, count: usize, what: &str) -> Result<&'a [u8], AbiError> {
    if self.remaining() < count {
      return Err(AbiError::StreamEnded(what.to_owned()));
    }
    let slice = &self.bytes[self.position..self.position + count];
    self.position += count;
    Ok(slice)
  }

  fn read_varuint(&mut self, what: &str) -> Result<u64, AbiError> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
      let byte = self.take(1, what)?[0];
      value |= ((byte & 0x7f) as u64) << shift;
      if byte & 0x80 == 0 {
        return Ok(value);
      }
      shift += 7;
      if shift > 63 {
        return Err(AbiError::UnexpectedValue("oversized varint".into(), what.into()));
      }
    }
  }
}

fn write_varuint(out: &mut Vec<u8>, mut value: u64) {
  loop {
    let mut byte = (value & 0x7f) as u8;
    value >>= 7;
    if value != 0 {
      byte |= 0x80;
    }
    out.push(byte);
    if value == 0 {
      return;
    }
  }
}

fn zigzag_encode(value: i64) -> u64 {
  ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
  ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn is_builtin(name: &str) -> bool {
  matches!(
    name,
    "bool"
      | "int8"
      | "uint8"
      | "int16"
      | "uint16"
      | "int32"
      | "uint32"
      | "int64"
      | "uint64"
      | "int128"
      | "uint128"
      | "varint32"
      | "varuint32"
      | "float32"
      | "float64"
      | "bytes"
      | "string"
      | "checksum256"
      | "time_point"
      | "name"
      | "signature"
      | "public_key"
  )
}

impl AbiSerializer {
  pub fn new(def: AbiDef) -> Result<Self, AbiError> {
    let mut typedefs = HashMap::new();
    for td in def.types {
      if typedefs.contains_key(&td.new_type_name)
        || is_builtin(&td.new_type_name)
      {
        return Err(AbiError::DuplicateType(td.new_type_name));
      }
      typedefs.insert(td.new_type_name, td.type_);
    }
    let mut structs = HashMap::new();
    for sd in def.structs {
      if structs.contains_key(&sd.name) {
        return Err(AbiError::DuplicateType(sd.name));
      }
      structs.insert(sd.name.clone(), sd);
    }
    let mut variants = HashMap::new();
    for vd in def.variants {
      if variants.contains_key(&vd.name) {
        return Err(AbiError::DuplicateType(vd.name));
      }
      variants.insert(vd.name.clone(), vd);
    }

    let serializer = Self { typedefs, structs, variants };
    serializer.validate()?;
    Ok(serializer)
  }

  pub fn from_json(json: &str) -> Result<Self, AbiError> {
    let def: AbiDef = serde_json::from_str(json)
      .map_err(|e| AbiError::UnexpectedValue(e.to_string(), "abi".into()))?;
    Self::new(def)
  }

  fn validate(&self) -> Result<(), AbiError> {
    // alias chains must terminate
    for name in self.typedefs.keys() {
      let mut walked = HashSet::new();
      let mut current = name.as_str();
      while let Some(next) = self.typedefs.get(current) {
        if !walked.insert(current) {
          return Err(AbiError::CircularReference(name.clone()));
        }
        current = next;
      }
    }
    // inheritance chains must terminate
    for sd in self.structs.values() {
      let mut walked = HashSet::new();
      let mut current = sd;
      while !current.base.is_empty() {
        if !walked.insert(current.name.clone()) {
          return Err(AbiError::CircularReference(sd.name.clone()));
        }
        current = self
          .structs
          .get(&current.base)
          .ok_or_else(|| AbiError::UnknownType(current.base.clone()))?;
      }
    }
    // every referenced type must exist
    for alias in self.typedefs.values() {
      self.ensure_known(alias)?;
    }
    for sd in self.structs.values() {
      for field in &sd.fields {
        self.ensure_known(strip_extension(&field.type_))?;
      }
    }
    for vd in self.variants.values() {
      for t in &vd.types {
        self.ensure_known(t)?;
      }
    }
    Ok(())
  }

  fn ensure_known(&self, type_name: &str) -> Result<(), AbiError> {
    if self.is_type(type_name) {
      Ok(())
    } else {
      Err(AbiError::UnknownType(type_name.to_owned()))
    }
  }

  pub fn is_type(&self, type_name: &str) -> bool {
    let fundamental = fundamental_type(strip_extension(type_name));
    let resolved = self.resolve(fundamental);
    is_builtin(resolved)
      || self.structs.contains_key(resolved)
      || self.variants.contains_key(resolved)
  }

  fn resolve<'a>(&'a self, mut type_name: &'a str) -> &'a str {
    let mut hops = 0;
    while let Some(next) = self.typedefs.get(type_name) {
      type_name = next;
      hops += 1;
      if hops > self.typedefs.len() {
        break; // cycles are rejected at load
      }
    }
    type_name
  }

  /// Packs a JSON value of the declared type into bytes.
  pub fn variant_to_binary(
    &self,
    type_name: &str,
    value: &Value,
  ) -> Result<Vec<u8>, AbiError> {
    let mut out = vec![];
    self.pack(type_name, value, &mut out, 0, true)?;
    Ok(out)
  }

  /// Unpacks bytes into a JSON value of the declared type. The whole
  /// stream must be consumed.
  pub fn binary_to_variant(
    &self,
    type_name: &str,
    bytes: &[u8],
  ) -> Result<Value, AbiError> {
    let mut stream = ReadStream { bytes, position: 0 };
    let value = self.unpack(type_name, &mut stream, 0, true)?;
    if stream.remaining() > 0 {
      return Err(AbiError::TrailingBytes(stream.remaining()));
    }
    Ok(value)
  }

  fn pack(
    &self,
    type_name: &str,
    value: &Value,
    out: &mut Vec<u8>,
    depth: usize,
    extensions_allowed: bool,
  ) -> Result<(), AbiError> {
    if depth > MAX_RECURSION_DEPTH {
      return Err(AbiError::RecursionDepth);
    }
    let type_name = strip_extension(type_name);

    if let Some(element) = type_name.strip_suffix("[]") {
      let Value::Array(items) = value else {
        return Err(unexpected(value, type_name));
      };
      write_varuint(out, items.len() as u64);
      for item in items {
        self.pack(element, item, out, depth + 1, false)?;
      }
      return Ok(());
    }
    if let Some((element, count)) = parse_fixed_array(type_name) {
      let Value::Array(items) = value else {
        return Err(unexpected(value, type_name));
      };
      if items.len() != count {
        return Err(unexpected(value, type_name));
      }
      for item in items {
        self.pack(element, item, out, depth + 1, false)?;
      }
      return Ok(());
    }
    if let Some(inner) = type_name.strip_suffix('?') {
      if value.is_null() {
        out.push(0);
      } else {
        out.push(1);
        self.pack(inner, value, out, depth + 1, false)?;
      }
      return Ok(());
    }

    let resolved = self.resolve(type_name);
    if is_builtin(resolved) {
      return pack_builtin(resolved, value, out);
    }
    if let Some(vd) = self.variants.get(resolved) {
      // a variant value is ["type_name", value]
      let Value::Array(pair) = value else {
        return Err(unexpected(value, resolved));
      };
      let (Some(Value::String(tag)), Some(inner)) =
        (pair.first(), pair.get(1))
      else {
        return Err(unexpected(value, resolved));
      };
      let index = vd
        .types
        .iter()
        .position(|t| t == tag)
        .ok_or_else(|| AbiError::UnknownType(tag.clone()))?;
      write_varuint(out, index as u64);
      return self.pack(&vd.types[index], inner, out, depth + 1, false);
    }
    if let Some(sd) = self.structs.get(resolved) {
      let Value::Object(object) = value else {
        return Err(unexpected(value, resolved));
      };
      return self.pack_struct(sd, object, out, depth, extensions_allowed);
    }
    Err(AbiError::UnknownType(type_name.to_owned()))
  }

  fn pack_struct(
    &self,
    sd: &StructDef,
    object: &Map<String, Value>,
    out: &mut Vec<u8>,
    depth: usize,
    extensions_allowed: bool,
  ) -> Result<(), AbiError> {
    if !sd.base.is_empty() {
      let base = self
        .structs
        .get(&sd.base)
        .ok_or_else(|| AbiError::UnknownType(sd.base.clone()))?;
      self.pack_struct(base, object, out, depth + 1, false)?;
    }

    let mut past_extension = false;
    for field in &sd.fields {
      let is_extension = field.type_.ends_with('$');
      if past_extension && !is_extension {
        return Err(AbiError::NonTrailingExtension(
          field.name.clone(),
          sd.name.clone(),
        ));
      }
      past_extension |= is_extension;

      match object.get(&field.name) {
        Some(value) => {
          self.pack(&field.type_, value, out, depth + 1, false)?;
        }
        None if is_extension && extensions_allowed => {
          // absent extension fields terminate the stream; everything
          // after them must be absent too
          for later in sd.fields.iter().skip_while(|f| f.name != field.name) {
            if object.contains_key(&later.name) {
              return Err(AbiError::MissingField(
                field.name.clone(),
                sd.name.clone(),
              ));
            }
          }
          return Ok(());
        }
        None => {
          return Err(AbiError::MissingField(
            field.name.clone(),
            sd.name.clone(),
          ))
        }
      }
    }
    Ok(())
  }

  fn unpack(
    &self,
    type_name: &str,
    stream: &mut ReadStream<'_>,
    depth: usize,
    extensions_allowed: bool,
  ) -> Result<Value, AbiError> {
    if depth > MAX_RECURSION_DEPTH {
      return Err(AbiError::RecursionDepth);
    }
    let type_name = strip_extension(type_name);

    if let Some(element) = type_name.strip_suffix("[]") {
      let count = stream.read_varuint(type_name)?;
      let mut items = Vec::with_capacity(count.min(4096) as usize);
      for _ in 0..count {
        items.push(self.unpack(element, stream, depth + 1, false)?);
      }
      return Ok(Value::Array(items));
    }
    if let Some((element, count)) = parse_fixed_array(type_name) {
      let mut items = Vec::with_capacity(count);
      for _ in 0..count {
        items.push(self.unpack(element, stream, depth + 1, false)?);
      }
      return Ok(Value::Array(items));
    }
    if let Some(inner) = type_name.strip_suffix('?') {
      let flag = stream.take(1, type_name)?[0];
      return if flag == 0 {
        Ok(Value::Null)
      } else {
        self.unpack(inner, stream, depth + 1, false)
      };
    }

    let resolved = self.resolve(type_name);
    if is_builtin(resolved) {
      return unpack_builtin(resolved, stream);
    }
    if let Some(vd) = self.variants.get(resolved) {
      let index = stream.read_varuint(resolved)?;
      let tag = vd
        .types
        .get(index as usize)
        .ok_or(AbiError::InvalidVariantTag(index, resolved.to_owned()))?;
      let inner = self.unpack(tag, stream, depth + 1, false)?;
      return Ok(json!([tag, inner]));
    }
    if let Some(sd) = self.structs.get(resolved) {
      let mut object = Map::new();
      self.unpack_struct(sd, stream, &mut object, depth, extensions_allowed)?;
      // empty structs are permitted, including at the top level
      return Ok(Value::Object(object));
    }
    Err(AbiError::UnknownType(type_name.to_owned()))
  }

  fn unpack_struct(
    &self,
    sd: &StructDef,
    stream: &mut ReadStream<'_>,
    object: &mut Map<String, Value>,
    depth: usize,
    extensions_allowed: bool,
  ) -> Result<(), AbiError> {
    if !sd.base.is_empty() {
      let base = self
        .structs
        .get(&sd.base)
        .ok_or_else(|| AbiError::UnknownType(sd.base.clone()))?;
      self.unpack_struct(base, stream, object, depth + 1, false)?;
    }

    let mut past_extension = false;
    for field in &sd.fields {
      let is_extension = field.type_.ends_with('$');
      if past_extension && !is_extension {
        return Err(AbiError::NonTrailingExtension(
          field.name.clone(),
          sd.name.clone(),
        ));
      }
      past_extension |= is_extension;

      if stream.remaining() == 0 && is_extension && extensions_allowed {
        // stream ended exactly where extensions begin
        return Ok(());
      }
      let value = self.unpack(&field.type_, stream, depth + 1, false)?;
      object.insert(field.name.clone(), value);
    }
    Ok(())
  }
}

fn strip_extension(type_name: &str) -> &str {
  type_name.strip_suffix('$').unwrap_or(type_name)
}

fn parse_fixed_array(type_name: &str) -> Option<(&str, usize)> {
  let open = type_name.rfind('[')?;
  let close = type_name.strip_suffix(']')?;
  let count: usize = close[open + 1..].parse().ok()?;
  Some((&type_name[..open], count))
}

fn unexpected(value: &Value, type_name: &str) -> AbiError {
  AbiError::UnexpectedValue(value.to_string(), type_name.to_owned())
}

fn pack_builtin(
  type_name: &str,
  value: &Value,
  out: &mut Vec<u8>,
) -> Result<(), AbiError> {
  macro_rules! int_from {
    ($ty:ty) => {{
      let parsed: $ty = match value {
        Value::Number(n) => n
          .as_i64()
          .and_then(|v| <$ty>::try_from(v).ok())
          .or_else(|| n.as_u64().and_then(|v| <$ty>::try_from(v).ok()))
          .ok_or_else(|| unexpected(value, type_name))?,
        Value::String(s) => {
          s.parse().map_err(|_| unexpected(value, type_name))?
        }
        _ => return Err(unexpected(value, type_name)),
      };
      out.extend_from_slice(&parsed.to_le_bytes());
    }};
  }

  match type_name {
    "bool" => {
      let b = value.as_bool().ok_or_else(|| unexpected(value, type_name))?;
      out.push(b as u8);
    }
    "int8" => int_from!(i8),
    "uint8" => int_from!(u8),
    "int16" => int_from!(i16),
    "uint16" => int_from!(u16),
    "int32" => int_from!(i32),
    "uint32" => int_from!(u32),
    "int64" => int_from!(i64),
    "uint64" => int_from!(u64),
    "int128" => int_from!(i128),
    "uint128" => int_from!(u128),
    "varint32" => {
      let v = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| unexpected(value, type_name))?;
      write_varuint(out, zigzag_encode(v));
    }
    "varuint32" => {
      let v = value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| unexpected(value, type_name))?;
      write_varuint(out, v);
    }
    "float32" => {
      let v = value.as_f64().ok_or_else(|| unexpected(value, type_name))?;
      out.extend_from_slice(&(v as f32).to_le_bytes());
    }
    "float64" => {
      let v = value.as_f64().ok_or_else(|| unexpected(value, type_name))?;
      out.extend_from_slice(&v.to_le_bytes());
    }
    "string" | "name" => {
      let s = value.as_str().ok_or_else(|| unexpected(value, type_name))?;
      write_varuint(out, s.len() as u64);
      out.extend_from_slice(s.as_bytes());
    }
    "bytes" | "signature" | "public_key" => {
      let s = value.as_str().ok_or_else(|| unexpected(value, type_name))?;
      let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|_| unexpected(value, type_name))?;
      write_varuint(out, bytes.len() as u64);
      out.extend_from_slice(&bytes);
    }
    "checksum256" => {
      let s = value.as_str().ok_or_else(|| unexpected(value, type_name))?;
      let mut bytes = [0u8; 32];
      bs58::decode(s)
        .into(&mut bytes)
        .map_err(|_| unexpected(value, type_name))?;
      out.extend_from_slice(&bytes);
    }
    "time_point" => {
      let ns = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| unexpected(value, type_name))?;
      out.extend_from_slice(&ns.to_le_bytes());
    }
    _ => return Err(AbiError::UnknownType(type_name.to_owned())),
  }
  Ok(())
}

fn unpack_builtin(
  type_name: &str,
  stream: &mut ReadStream<'_>,
) -> Result<Value, AbiError> {
  macro_rules! int_to {
    ($ty:ty, $n:expr, $stringly:expr) => {{
      let bytes: [u8; $n] = stream
        .take($n, type_name)?
        .try_into()
        .expect("exact length");
      let v = <$ty>::from_le_bytes(bytes);
      if $stringly {
        json!(v.to_string())
      } else {
        json!(v)
      }
    }};
  }

  Ok(match type_name {
    "bool" => json!(stream.take(1, type_name)?[0] != 0),
    "int8" => int_to!(i8, 1, false),
    "uint8" => int_to!(u8, 1, false),
    "int16" => int_to!(i16, 2, false),
    "uint16" => int_to!(u16, 2, false),
    "int32" => int_to!(i32, 4, false),
    "uint32" => int_to!(u32, 4, false),
    "int64" => int_to!(i64, 8, false),
    "uint64" => int_to!(u64, 8, true),
    "int128" => int_to!(i128, 16, true),
    "uint128" => int_to!(u128, 16, true),
    "varint32" => json!(zigzag_decode(stream.read_varuint(type_name)?)),
    "varuint32" => json!(stream.read_varuint(type_name)?),
    "float32" => {
      let bytes: [u8; 4] =
        stream.take(4, type_name)?.try_into().expect("exact length");
      json!(f32::from_le_bytes(bytes) as f64)
    }
    "float64" => {
      let bytes: [u8; 8] =
        stream.take(8, type_name)?.try_into().expect("exact length");
      json!(f64::from_le_bytes(bytes))
    }
    "string" | "name" => {
      let len = stream.read_varuint(type_name)? as usize;
      let bytes = stream.take(len, type_name)?;
      json!(String::from_utf8(bytes.to_vec())
        .map_err(|_| AbiError::UnexpectedValue("invalid utf8".into(), type_name.into()))?)
    }
    "bytes" | "signature" | "public_key" => {
      let len = stream.read_varuint(type_name)? as usize;
      let bytes = stream.take(len, type_name)?;
      json!(bs58::encode(bytes).into_string())
    }
    "checksum256" => {
      let bytes = stream.take(32, type_name)?;
      json!(bs58::encode(bytes).into_string())
    }
    "time_point" => {
      let bytes: [u8; 8] =
        stream.take(8, type_name)?.try_into().expect("exact length");
      json!(TimePoint(i64::from_le_bytes(bytes)).as_nanos())
    }
    _ => return Err(AbiError::UnknownType(type_name.to_owned())),
  })
}

fn fundamental_type(type_name: &str) -> &str {
  if let Some(element) = type_name.strip_suffix("[]") {
    return fundamental_type(element);
  }
  if let Some((element, _)) = parse_fixed_array(type_name) {
    return fundamental_type(element);
  }
  if let Some(inner) = type_name.strip_suffix('?') {
    return fundamental_type(inner);
  }
  type_name
}

#[cfg(test)]
mod tests {
  use super::*;

  fn transfer_abi() -> AbiSerializer {
    AbiSerializer::from_json(
      r#"{
        "types": [{"new_type_name": "account", "type": "name"}],
        "structs": [
          {
            "name": "transfer",
            "base": "",
            "fields": [
              {"name": "from", "type": "account"},
              {"name": "to", "type": "account"},
              {"name": "amount", "type": "uint64"},
              {"name": "memo", "type": "string?"},
              {"name": "tags", "type": "string[]"},
              {"name": "priority", "type": "uint8$"}
            ]
          }
        ],
        "variants": [
          {"name": "key_or_hash", "types": ["public_key", "checksum256"]}
        ]
      }"#,
    )
    .unwrap()
  }

  #[test]
  fn struct_roundtrip() {
    let abi = transfer_abi();
    let value = json!({
      "from": "alice",
      "to": "bob",
      "amount": "12345678901234567890",
      "memo": "hello",
      "tags": ["a", "b"],
      "priority": 7
    });
    let packed = abi.variant_to_binary("transfer", &value).unwrap();
    let unpacked = abi.binary_to_variant("transfer", &packed).unwrap();
    assert_eq!(unpacked, value);
  }

  #[test]
  fn extension_fields_may_be_absent_at_stream_end() {
    let abi = transfer_abi();
    let value = json!({
      "from": "alice",
      "to": "bob",
      "amount": 5,
      "memo": null,
      "tags": []
    });
    let packed = abi.variant_to_binary("transfer", &value).unwrap();
    let unpacked = abi.binary_to_variant("transfer", &packed).unwrap();
    assert!(unpacked.get("priority").is_none());
    assert_eq!(unpacked["amount"], json!("5"));
  }

  #[test]
  fn variant_roundtrip() {
    let abi = transfer_abi();
    let value = json!(["checksum256", bs58::encode([7u8; 32]).into_string()]);
    let packed = abi.variant_to_binary("key_or_hash", &value).unwrap();
    // tag 1 as a varint, then the raw 32 bytes
    assert_eq!(packed.len(), 33);
    assert_eq!(packed[0], 1);
    let unpacked = abi.binary_to_variant("key_or_hash", &packed).unwrap();
    assert_eq!(unpacked, value);
  }

  #[test]
  fn circular_alias_rejected() {
    let err = AbiSerializer::from_json(
      r#"{"types": [
        {"new_type_name": "a", "type": "b"},
        {"new_type_name": "b", "type": "a"}
      ]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, AbiError::CircularReference(_)));
  }

  #[test]
  fn circular_struct_base_rejected() {
    let err = AbiSerializer::from_json(
      r#"{"structs": [
        {"name": "a", "base": "b", "fields": []},
        {"name": "b", "base": "a", "fields": []}
      ]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, AbiError::CircularReference(_)));
  }

  #[test]
  fn empty_struct_at_top_level_is_allowed() {
    let abi = AbiSerializer::from_json(
      r#"{"structs": [{"name": "nothing", "base": "", "fields": []}]}"#,
    )
    .unwrap();
    let packed = abi.variant_to_binary("nothing", &json!({})).unwrap();
    assert!(packed.is_empty());
    assert_eq!(abi.binary_to_variant("nothing", &packed).unwrap(), json!({}));
  }

  #[test]
  fn base_struct_fields_come_first() {
    let abi = AbiSerializer::from_json(
      r#"{"structs": [
        {"name": "header", "base": "", "fields": [{"name": "id", "type": "uint32"}]},
        {"name": "message", "base": "header", "fields": [{"name": "body", "type": "string"}]}
      ]}"#,
    )
    .unwrap();
    let packed = abi
      .variant_to_binary("message", &json!({"id": 9, "body": "x"}))
      .unwrap();
    assert_eq!(&packed[..4], &9u32.to_le_bytes());
    let unpacked = abi.binary_to_variant("message", &packed).unwrap();
    assert_eq!(unpacked, json!({"id": 9, "body": "x"}));
  }

  #[test]
  fn fixed_arrays_have_no_length_prefix() {
    let abi = AbiSerializer::from_json(
      r#"{"structs": [{"name": "grid", "base": "", "fields": [{"name": "cells", "type": "uint8[3]"}]}]}"#,
    )
    .unwrap();
    let packed = abi
      .variant_to_binary("grid", &json!({"cells": [1, 2, 3]}))
      .unwrap();
    assert_eq!(packed, vec![1, 2, 3]);
    assert!(abi
      .variant_to_binary("grid", &json!({"cells": [1, 2]}))
      .is_err());
  }

  #[test]
  fn trailing_bytes_rejected() {
    let abi = transfer_abi();
    let value = json!(["checksum256", bs58::encode([1u8; 32]).into_string()]);
    let mut packed = abi.variant_to_binary("key_or_hash", &value).unwrap();
    packed.push(0xff);
    assert!(matches!(
      abi.binary_to_variant("key_or_hash", &packed),
      Err(AbiError::TrailingBytes(1))
    ));
  }

  #[test]
  fn varint_zigzag_roundtrip() {
    for v in [-300i64, -1, 0, 1, 300, i32::MAX as i64] {
      assert_eq!(zigzag_decode(zigzag_encode(v)), v);
    }
  }
}
