//! Decoding of raw on-chain payloads back into typed column values.
//!
//! The TrustDBle storage engine writes each row to the chain as a hex string:
//! a 32-byte primary key hash followed by the encoded column values in table
//! schema order, optionally AES-256-CBC encrypted. Everything in this module
//! is a pure function of (payload, schema, key), nothing here touches the
//! network or the database.

use crate::chain::{OperationKind, RawEvent};

use std::{fmt, str::FromStr};

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length in hex characters of the primary key hash prefixing every payload
pub const KEY_HASH_HEX_LEN: usize = 64;

// Per-column widths, in hex characters (2 hex characters = 1 byte)
const TINYINT_HEX_LEN: usize = 2;
const SMALLINT_HEX_LEN: usize = 4;
const MEDIUMINT_HEX_LEN: usize = 6;
const INT_HEX_LEN: usize = 8;
const BIGINT_HEX_LEN: usize = 16;
// The storage engine reserves 4 bytes per character (utf8mb4), so one CHAR
// character occupies 8 hex characters on the wire.
const CHAR_UNIT_HEX_LEN: usize = 8;
const VARCHAR_HEAD_HEX_LEN: usize = 2;
const DATE_HEX_LEN: usize = 6;

// One AES block, in hex characters
const AES_BLOCK_HEX_LEN: usize = 16 * 2;

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended before the schema was fully consumed
    ShortPayload { expected: usize, got: usize },
    /// Not valid hex where hex was expected
    InvalidHex(String),
    /// A decoded string field isn't UTF-8
    InvalidUtf8(String),
    /// Ciphertext or key/iv not usable
    Decrypt(String),
    /// A column type we don't know how to decode
    UnknownColumnType(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::ShortPayload { expected, got } => write!(
                f,
                "Payload too short: expected {} hex characters, got {}",
                expected, got
            ),
            DecodeError::InvalidHex(e) => write!(f, "Invalid hex in payload: {}", e),
            DecodeError::InvalidUtf8(e) => write!(f, "Invalid UTF-8 in string field: {}", e),
            DecodeError::Decrypt(e) => write!(f, "Decryption error: {}", e),
            DecodeError::UnknownColumnType(t) => write!(f, "Unknown column type: '{}'", t),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<hex::FromHexError> for DecodeError {
    fn from(e: hex::FromHexError) -> Self {
        DecodeError::InvalidHex(e.to_string())
    }
}

/// One column of a shared table, as declared in its SQL schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    MediumInt,
    Int,
    BigInt,
    Char(usize),
    Varchar(usize),
    Date,
}

impl ColumnType {
    /// Width of this column on the wire, in hex characters
    pub fn hex_width(&self) -> usize {
        match self {
            ColumnType::TinyInt => TINYINT_HEX_LEN,
            ColumnType::SmallInt => SMALLINT_HEX_LEN,
            ColumnType::MediumInt => MEDIUMINT_HEX_LEN,
            ColumnType::Int => INT_HEX_LEN,
            ColumnType::BigInt => BIGINT_HEX_LEN,
            ColumnType::Char(n) => n * CHAR_UNIT_HEX_LEN,
            ColumnType::Varchar(n) => VARCHAR_HEAD_HEX_LEN + n * CHAR_UNIT_HEX_LEN,
            ColumnType::Date => DATE_HEX_LEN,
        }
    }

    /// Decode one field of this column's width into its text rendering
    fn decode(&self, field: &str) -> Result<String, DecodeError> {
        match self {
            ColumnType::TinyInt
            | ColumnType::SmallInt
            | ColumnType::MediumInt
            | ColumnType::Int
            | ColumnType::BigInt => Ok(decode_int(field)?.to_string()),
            ColumnType::Char(_) => decode_char(field),
            ColumnType::Varchar(_) => decode_varchar(field),
            ColumnType::Date => decode_date(field),
        }
    }
}

impl FromStr for ColumnType {
    type Err = DecodeError;

    /// Parses a single SQL column type, eg "int", "varchar(20)" or "char(2)"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, param) = match s.find('(') {
            Some(i) => {
                let param = s[i + 1..]
                    .trim_end_matches(')')
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| DecodeError::UnknownColumnType(s.to_string()))?;
                (&s[..i], Some(param))
            }
            None => (s, None),
        };

        match (name.to_lowercase().as_str(), param) {
            ("tinyint", _) => Ok(ColumnType::TinyInt),
            ("smallint", _) => Ok(ColumnType::SmallInt),
            ("mediumint", _) => Ok(ColumnType::MediumInt),
            ("int", _) => Ok(ColumnType::Int),
            ("bigint", _) => Ok(ColumnType::BigInt),
            ("char", Some(n)) => Ok(ColumnType::Char(n)),
            ("varchar", Some(n)) => Ok(ColumnType::Varchar(n)),
            ("date", _) => Ok(ColumnType::Date),
            _ => Err(DecodeError::UnknownColumnType(s.to_string())),
        }
    }
}

/// The ordered column schema of a shared table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema(Vec<ColumnType>);

impl TableSchema {
    pub fn new(columns: Vec<ColumnType>) -> TableSchema {
        TableSchema(columns)
    }

    pub fn columns(&self) -> &[ColumnType] {
        &self.0
    }

    /// Total width of one encoded row's value segment, in hex characters
    pub fn hex_width(&self) -> usize {
        self.0.iter().map(|c| c.hex_width()).sum()
    }
}

impl FromStr for TableSchema {
    type Err = DecodeError;

    /// Parses the comma-separated column type list stored in the catalog,
    /// eg "int,varchar(20),date"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .filter(|c| !c.trim().is_empty())
            .map(ColumnType::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(TableSchema)
    }
}

/// AES-256-CBC key material from the catalog, one pair per encrypted table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionParams {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl EncryptionParams {
    /// Both are stored hex-encoded in the catalog
    pub fn from_hex(key: &str, iv: &str) -> Result<EncryptionParams, DecodeError> {
        Ok(EncryptionParams {
            key: hex::decode(key)?,
            iv: hex::decode(iv)?,
        })
    }
}

/// One decoded on-chain write or remove, ready to be appended to a history table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTuple {
    pub block_number: u64,
    pub timestamp: u64,
    pub editor: String,
    pub tx_id: String,
    pub kind: OperationKind,
    /// Hex of the 32-byte primary key hash
    pub key_hash: String,
    /// Comma-joined column values for a PUT, None for a REMOVE
    pub value: Option<String>,
}

/// Interface of the payload decoders given to the monitor for turning raw
/// chain events into typed tuples. Implementations must be pure: same event,
/// schema and key always give the same tuple.
pub trait KeyValueDecoder {
    fn decode(
        &self,
        event: &RawEvent,
        schema: &TableSchema,
        encryption: Option<&EncryptionParams>,
    ) -> Result<DecodedTuple, DecodeError>;
}

/// Decoder for rows encoded as hex strings following the storage engine's SQL
/// encoding schema.
pub struct HexDecoder;

impl KeyValueDecoder for HexDecoder {
    fn decode(
        &self,
        event: &RawEvent,
        schema: &TableSchema,
        encryption: Option<&EncryptionParams>,
    ) -> Result<DecodedTuple, DecodeError> {
        let value = match event.kind {
            // A REMOVE payload is the bare primary key hash
            OperationKind::Remove => None,
            OperationKind::Put => {
                let value_segment =
                    event
                        .payload
                        .get(KEY_HASH_HEX_LEN..)
                        .ok_or(DecodeError::ShortPayload {
                            expected: KEY_HASH_HEX_LEN,
                            got: event.payload.len(),
                        })?;
                Some(decode_value_segment(value_segment, schema, encryption)?)
            }
        };
        let key_hash = match event.kind {
            OperationKind::Remove => event.payload.clone(),
            OperationKind::Put => event.payload[..KEY_HASH_HEX_LEN].to_string(),
        };

        Ok(DecodedTuple {
            block_number: event.block_number,
            timestamp: event.timestamp,
            editor: event.editor.clone(),
            tx_id: event.tx_id.clone(),
            kind: event.kind,
            key_hash,
            value,
        })
    }
}

/// Decode the value segment of a PUT payload into the comma-joined rendering
/// of its columns, decrypting it first if the table has a key configured.
fn decode_value_segment(
    segment: &str,
    schema: &TableSchema,
    encryption: Option<&EncryptionParams>,
) -> Result<String, DecodeError> {
    let value_width = schema.hex_width();

    let plain = match encryption {
        Some(params) => {
            // The engine zero-pads the plaintext into one more AES block, so
            // the ciphertext is always the next block boundary above the
            // value width.
            let ciphertext_width = encrypted_hex_len(value_width);
            let ciphertext =
                segment
                    .get(segment.len().saturating_sub(ciphertext_width)..)
                    .filter(|c| c.len() == ciphertext_width)
                    .ok_or(DecodeError::ShortPayload {
                        expected: ciphertext_width,
                        got: segment.len(),
                    })?;
            decrypt(ciphertext, params)?
        }
        // Plaintext rows may be left-padded by the transaction encoding: the
        // value is the tail of the segment.
        None => segment
            .get(segment.len().saturating_sub(value_width)..)
            .filter(|v| v.len() == value_width)
            .ok_or(DecodeError::ShortPayload {
                expected: value_width,
                got: segment.len(),
            })?
            .to_string(),
    };

    decode_value(&plain, schema)
}

/// Consume a decoded (plaintext) hex value left-to-right in schema order.
/// Trailing characters beyond the schema width are padding and ignored.
fn decode_value(data: &str, schema: &TableSchema) -> Result<String, DecodeError> {
    let mut remaining = data;
    let mut fields = Vec::with_capacity(schema.columns().len());

    for column in schema.columns() {
        let width = column.hex_width();
        let field = remaining.get(..width).ok_or(DecodeError::ShortPayload {
            expected: width,
            got: remaining.len(),
        })?;
        remaining = &remaining[width..];
        fields.push(column.decode(field)?);
    }

    Ok(fields.join(","))
}

/// Ciphertext length for a plaintext of `hex_len` hex characters: the next
/// AES block boundary strictly above it.
fn encrypted_hex_len(hex_len: usize) -> usize {
    (hex_len / AES_BLOCK_HEX_LEN + 1) * AES_BLOCK_HEX_LEN
}

fn decrypt(ciphertext: &str, params: &EncryptionParams) -> Result<String, DecodeError> {
    let mut buf = hex::decode(ciphertext)?;
    let decryptor = Aes256CbcDec::new_from_slices(&params.key, &params.iv)
        .map_err(|e| DecodeError::Decrypt(format!("Bad key or iv length: {}", e)))?;
    let plain = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| DecodeError::Decrypt(format!("Decrypting value segment: {}", e)))?;

    // Keep working on hex, the column parsers all expect it
    Ok(hex::encode(plain))
}

/// Decode a little-endian hex field into an unsigned integer
fn decode_int(field: &str) -> Result<u64, DecodeError> {
    let reversed = reverse_endianness(field)?;
    u64::from_str_radix(&reversed, 16).map_err(|e| DecodeError::InvalidHex(e.to_string()))
}

/// Reverse the byte order of a hex string (2 hex characters per byte)
fn reverse_endianness(field: &str) -> Result<String, DecodeError> {
    if field.len() % 2 != 0 || !field.is_ascii() {
        return Err(DecodeError::InvalidHex(format!(
            "Not an even-length hex bytestring: '{}'",
            field
        )));
    }

    let mut reversed = String::with_capacity(field.len());
    for i in (0..field.len()).step_by(2).rev() {
        reversed.push_str(&field[i..i + 2]);
    }
    Ok(reversed)
}

/// Decode a fixed-width CHAR field. The engine zero-pads unused bytes, strip
/// them before the UTF-8 decode.
fn decode_char(field: &str) -> Result<String, DecodeError> {
    let mut bytes = hex::decode(field)?;
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
}

/// Decode a VARCHAR field: the first byte is the actual string length in
/// bytes, the rest of the field is padding.
fn decode_varchar(field: &str) -> Result<String, DecodeError> {
    let head = field.get(..VARCHAR_HEAD_HEX_LEN).ok_or(DecodeError::ShortPayload {
        expected: VARCHAR_HEAD_HEX_LEN,
        got: field.len(),
    })?;
    let length =
        usize::from_str_radix(head, 16).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;

    let data = field
        .get(VARCHAR_HEAD_HEX_LEN..VARCHAR_HEAD_HEX_LEN + length * 2)
        .ok_or(DecodeError::ShortPayload {
            expected: VARCHAR_HEAD_HEX_LEN + length * 2,
            got: field.len(),
        })?;
    let bytes = hex::decode(data)?;
    String::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
}

/// Decode a DATE field. A date is a little-endian three-byte integer packed
/// as year*16*32 + month*32 + day.
fn decode_date(field: &str) -> Result<String, DecodeError> {
    let packed = decode_int(field)?;
    let day = packed % 32;
    let month = ((packed - day) / 32) % 16;
    let year = (packed - day - month * 32) / (16 * 32);

    Ok(format!("{}-{}-{}", year, month, day))
}

// Encoding counterparts, test-only: production code never writes to the chain.
#[cfg(test)]
pub mod encode {
    use super::*;

    pub fn encode_int(value: u64, column: &ColumnType) -> String {
        let width = column.hex_width();
        let be = format!("{:0>width$x}", value, width = width);
        reverse_endianness(&be).expect("even width")
    }

    pub fn encode_char(value: &str, n: usize) -> String {
        let mut field = hex::encode(value.as_bytes());
        while field.len() < n * CHAR_UNIT_HEX_LEN {
            field.push_str("00");
        }
        field
    }

    pub fn encode_varchar(value: &str, n: usize) -> String {
        let mut field = format!("{:02x}", value.len());
        field.push_str(&hex::encode(value.as_bytes()));
        while field.len() < VARCHAR_HEAD_HEX_LEN + n * CHAR_UNIT_HEX_LEN {
            field.push_str("00");
        }
        field
    }

    pub fn encode_date(year: u64, month: u64, day: u64) -> String {
        encode_int(year * 16 * 32 + month * 32 + day, &ColumnType::Date)
    }
}
