//! Binary serialization of result tables.
//!
//! Layout of an encoded payload:
//!
//! ```text
//! +--------+---------+-------------+-----------------------------+
//! | "VZCT" | version | compression | body (MessagePack, maybe    |
//! | 4 B    | u8 = 1  | u8 0 / 1    | zstd-compressed)            |
//! +--------+---------+-------------+-----------------------------+
//! ```
//!
//! The body is `{ columns: [{name, type}], row_count, data: [column] }` with
//! column values stored contiguously by type. Timestamps travel as
//! `(unix seconds, nanoseconds)` pairs in UTC.
//!
//! `decode(encode(t)) == t` for every table, including empty ones and
//! columns that are entirely null. Float cells come back bit-identical, so a
//! `NaN` survives the trip even though it never compares equal.

use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vizcache_core::{Column, ColumnData, ColumnType, Table};

pub const MAGIC: &[u8; 4] = b"VZCT";
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2;
const FLAG_PLAIN: u8 = 0;
const FLAG_ZSTD: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The bytes are not a payload this codec produced (truncated, wrong
    /// magic, unknown version, or an inconsistent body).
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("failed to encode table: {0}")]
    Encode(String),
}

impl CodecError {
    fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptPayload(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    pub compression: Compression,
    /// Bodies smaller than this are stored uncompressed.
    pub compression_threshold: usize,
    /// Upper bound on a decompressed body; larger ones are treated as corrupt.
    pub max_decompressed_len: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Zstd { level: 3 },
            compression_threshold: 4096,
            max_decompressed_len: 256 * 1024 * 1024,
        }
    }
}

/// Stateless table codec. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn encode(&self, table: &Table) -> Result<Vec<u8>, CodecError> {
        let wire = WireTableRef::from_table(table);
        let body = rmp_serde::to_vec(&wire).map_err(|e| CodecError::Encode(e.to_string()))?;

        let (flag, body) = match self.config.compression {
            Compression::Zstd { level } if body.len() >= self.config.compression_threshold => {
                let compressed = zstd::encode_all(body.as_slice(), level)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                (FLAG_ZSTD, compressed)
            }
            _ => (FLAG_PLAIN, body),
        };

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(flag);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Table, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::corrupt(format!(
                "payload is {} bytes, header alone is {HEADER_LEN}",
                bytes.len()
            )));
        }
        let (header, body) = bytes.split_at(HEADER_LEN);
        if &header[..MAGIC.len()] != MAGIC {
            return Err(CodecError::corrupt("bad magic"));
        }
        let version = header[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(CodecError::corrupt(format!("unsupported version {version}")));
        }

        let wire: WireTable = match header[MAGIC.len() + 1] {
            FLAG_PLAIN => rmp_serde::from_slice::<WireTable>(body),
            FLAG_ZSTD => {
                let raw = decompress(body, self.config.max_decompressed_len)?;
                rmp_serde::from_slice::<WireTable>(&raw)
            }
            other => return Err(CodecError::corrupt(format!("unknown compression flag {other}"))),
        }
        .map_err(|e| CodecError::corrupt(e.to_string()))?;

        wire.into_table()
    }
}

fn decompress(body: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    let decoder =
        zstd::stream::read::Decoder::new(body).map_err(|e| CodecError::corrupt(format!("zstd: {e}")))?;
    let mut raw = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| CodecError::corrupt(format!("zstd: {e}")))?;
    if raw.len() > limit {
        return Err(CodecError::corrupt(format!(
            "decompressed body exceeds {limit} bytes"
        )));
    }
    Ok(raw)
}

#[derive(Serialize)]
struct WireField<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    column_type: ColumnType,
}

#[derive(Serialize)]
enum WireColumnRef<'a> {
    Text(&'a [Option<String>]),
    Integer(&'a [Option<i64>]),
    Float(&'a [Option<f64>]),
    Boolean(&'a [Option<bool>]),
    Timestamp(Vec<Option<(i64, u32)>>),
}

#[derive(Serialize)]
struct WireTableRef<'a> {
    columns: Vec<WireField<'a>>,
    row_count: u64,
    data: Vec<WireColumnRef<'a>>,
}

impl<'a> WireTableRef<'a> {
    fn from_table(table: &'a Table) -> Self {
        let columns = table
            .columns()
            .iter()
            .map(|c| WireField {
                name: c.name(),
                column_type: c.column_type(),
            })
            .collect();
        let data = table
            .columns()
            .iter()
            .map(|c| match c.data() {
                ColumnData::Text(v) => WireColumnRef::Text(v),
                ColumnData::Integer(v) => WireColumnRef::Integer(v),
                ColumnData::Float(v) => WireColumnRef::Float(v),
                ColumnData::Boolean(v) => WireColumnRef::Boolean(v),
                ColumnData::Timestamp(v) => WireColumnRef::Timestamp(
                    v.iter()
                        .map(|t| t.map(|t| (t.timestamp(), t.timestamp_subsec_nanos())))
                        .collect(),
                ),
            })
            .collect();
        Self {
            columns,
            row_count: table.row_count() as u64,
            data,
        }
    }
}

#[derive(Deserialize)]
struct OwnedField {
    name: String,
    #[serde(rename = "type")]
    column_type: ColumnType,
}

#[derive(Deserialize)]
enum WireColumn {
    Text(Vec<Option<String>>),
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Boolean(Vec<Option<bool>>),
    Timestamp(Vec<Option<(i64, u32)>>),
}

#[derive(Deserialize)]
struct WireTable {
    columns: Vec<OwnedField>,
    row_count: u64,
    data: Vec<WireColumn>,
}

impl WireTable {
    fn into_table(self) -> Result<Table, CodecError> {
        if self.columns.len() != self.data.len() {
            return Err(CodecError::corrupt(format!(
                "{} fields but {} data columns",
                self.columns.len(),
                self.data.len()
            )));
        }
        let row_count = usize::try_from(self.row_count)
            .map_err(|_| CodecError::corrupt("row count does not fit in memory"))?;

        let mut columns = Vec::with_capacity(self.columns.len());
        for (field, wire) in self.columns.into_iter().zip(self.data) {
            let data = match wire {
                WireColumn::Text(v) => ColumnData::Text(v),
                WireColumn::Integer(v) => ColumnData::Integer(v),
                WireColumn::Float(v) => ColumnData::Float(v),
                WireColumn::Boolean(v) => ColumnData::Boolean(v),
                WireColumn::Timestamp(v) => ColumnData::Timestamp(
                    v.into_iter()
                        .map(|t| t.map(to_datetime).transpose())
                        .collect::<Result<_, _>>()?,
                ),
            };
            if data.column_type() != field.column_type {
                return Err(CodecError::corrupt(format!(
                    "column `{}` declared {:?} but holds {:?}",
                    field.name,
                    field.column_type,
                    data.column_type()
                )));
            }
            columns.push(Column::new(field.name, data));
        }

        Table::with_row_count(columns, row_count).map_err(|e| CodecError::corrupt(e.to_string()))
    }
}

fn to_datetime((secs, nanos): (i64, u32)) -> Result<DateTime<Utc>, CodecError> {
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| CodecError::corrupt(format!("timestamp ({secs}, {nanos}) out of range")))
}
