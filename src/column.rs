//! 컬럼 타입별 셀 값 디코딩
//!
//! 테이블 맵의 타입 코드와 메타데이터, 그리고 INFORMATION_SCHEMA에서 얻은 컬럼 정보로
//! 행 이미지의 각 셀을 `CellValue`로 변환합니다.

use crate::error::{CdcError, Result};
use crate::events::CellValue;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::{TimeZone, Utc};
use std::io::{Cursor, Read};

/// MySQL 컬럼 타입 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(val: u8) -> Option<Self> {
        let column_type = match val {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        };
        Some(column_type)
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: String,
    pub unsigned: bool,
    /// ENUM/SET 값 목록 (정의 순서)
    pub enum_values: Vec<String>,
}

impl ColumnInfo {
    /// `COLUMN_TYPE` 값 (예: `int(10) unsigned`, `enum('a','b')`)으로부터 생성
    pub fn from_definition(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        let column_type = column_type.into();
        let unsigned = column_type.to_ascii_lowercase().contains("unsigned");
        let enum_values = parse_enum_values(&column_type);
        ColumnInfo {
            name: name.into(),
            column_type,
            unsigned,
            enum_values,
        }
    }

    /// BINARY/VARBINARY/BLOB 계열이면 문자열로 해석하지 않음
    pub fn is_binary(&self) -> bool {
        let lower = self.column_type.to_ascii_lowercase();
        lower.starts_with("binary")
            || lower.starts_with("varbinary")
            || lower.contains("blob")
    }
}

/// `enum('a','b')` / `set('x','y')`의 값 목록
fn parse_enum_values(column_type: &str) -> Vec<String> {
    let lower = column_type.to_ascii_lowercase();
    let body = if lower.starts_with("enum(") {
        &column_type[5..]
    } else if lower.starts_with("set(") {
        &column_type[4..]
    } else {
        return Vec::new();
    };

    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quote) {
            ('\'', false) => in_quote = true,
            ('\'', true) => {
                // '' 는 따옴표 문자
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    current.push('\'');
                } else {
                    in_quote = false;
                    values.push(std::mem::take(&mut current));
                }
            }
            (_, true) => current.push(c),
            _ => {}
        }
    }
    values
}

/// 테이블 맵의 컬럼별 메타데이터 읽기
pub fn read_metadata(cursor: &mut Cursor<&[u8]>, column_type: u8) -> Result<u16> {
    let meta = match ColumnType::from_u8(column_type) {
        Some(
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Timestamp2
            | ColumnType::DateTime2
            | ColumnType::Time2,
        ) => cursor.read_u8()? as u16,
        Some(ColumnType::Varchar | ColumnType::VarString) => cursor.read_u16::<LittleEndian>()?,
        Some(ColumnType::Bit) => {
            let bits = cursor.read_u8()? as u16;
            let bytes = cursor.read_u8()? as u16;
            (bytes << 8) | bits
        }
        Some(ColumnType::NewDecimal) => {
            let precision = cursor.read_u8()? as u16;
            let scale = cursor.read_u8()? as u16;
            (precision << 8) | scale
        }
        Some(ColumnType::String | ColumnType::Enum | ColumnType::Set) => {
            let real_type = cursor.read_u8()? as u16;
            let length = cursor.read_u8()? as u16;
            (real_type << 8) | length
        }
        _ => 0,
    };
    Ok(meta)
}

/// 셀 하나 디코딩
pub fn decode_cell(
    cursor: &mut Cursor<&[u8]>,
    column_type: u8,
    meta: u16,
    column: Option<&ColumnInfo>,
) -> Result<CellValue> {
    let unsigned = column.map_or(false, |c| c.unsigned);

    let Some(kind) = ColumnType::from_u8(column_type) else {
        return Err(CdcError::BinlogParseError(format!(
            "Unsupported column type {}",
            column_type
        )));
    };

    let value = match kind {
        ColumnType::Tiny => integer(cursor.read_u8()? as u64, 1, unsigned),
        ColumnType::Short => integer(cursor.read_u16::<LittleEndian>()? as u64, 2, unsigned),
        ColumnType::Int24 => integer(cursor.read_u24::<LittleEndian>()? as u64, 3, unsigned),
        ColumnType::Long => integer(cursor.read_u32::<LittleEndian>()? as u64, 4, unsigned),
        ColumnType::LongLong => {
            let raw = cursor.read_u64::<LittleEndian>()?;
            if unsigned {
                CellValue::UInt(raw)
            } else {
                CellValue::Int(raw as i64)
            }
        }
        ColumnType::Float => CellValue::Float(cursor.read_f32::<LittleEndian>()?),
        ColumnType::Double => CellValue::Double(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Null => CellValue::Null,
        ColumnType::Year => {
            let year = cursor.read_u8()? as i64;
            CellValue::Int(if year == 0 { 0 } else { 1900 + year })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Date(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0F,
                packed & 0x1F
            ))
        }
        ColumnType::Time => {
            let packed = cursor.read_i24::<LittleEndian>()?;
            let sign = if packed < 0 { "-" } else { "" };
            let v = packed.unsigned_abs();
            CellValue::Time(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                v / 10000,
                (v / 100) % 100,
                v % 100
            ))
        }
        ColumnType::DateTime => {
            let v = cursor.read_u64::<LittleEndian>()?;
            CellValue::DateTime(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                v / 10_000_000_000,
                (v / 100_000_000) % 100,
                (v / 1_000_000) % 100,
                (v / 10_000) % 100,
                (v / 100) % 100,
                v % 100
            ))
        }
        ColumnType::Timestamp => timestamp(cursor.read_u32::<LittleEndian>()? as i64, 0, 0)?,
        ColumnType::Timestamp2 => {
            let fsp = meta as u8;
            let secs = cursor.read_u32::<BigEndian>()? as i64;
            let micros = read_fraction(cursor, fsp)?;
            timestamp(secs, micros, fsp)?
        }
        ColumnType::DateTime2 => decode_datetime2(cursor, meta as u8)?,
        ColumnType::Time2 => decode_time2(cursor, meta as u8)?,
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            text_or_bytes(read_bytes(cursor, len)?, column)
        }
        ColumnType::String => {
            let (real_type, length) = string_real_type(meta);
            match ColumnType::from_u8(real_type) {
                Some(ColumnType::Enum) => decode_enum(cursor, length, column)?,
                Some(ColumnType::Set) => decode_set(cursor, length, column)?,
                _ => {
                    let len = if length < 256 {
                        cursor.read_u8()? as usize
                    } else {
                        cursor.read_u16::<LittleEndian>()? as usize
                    };
                    text_or_bytes(read_bytes(cursor, len)?, column)
                }
            }
        }
        ColumnType::Enum => decode_enum(cursor, (meta & 0xFF) as usize, column)?,
        ColumnType::Set => decode_set(cursor, (meta & 0xFF) as usize, column)?,
        ColumnType::Bit => {
            let nbits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
            let len = nbits.div_ceil(8);
            CellValue::UInt(cursor.read_uint::<BigEndian>(len.clamp(1, 8))?)
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob => {
            let len = read_length(cursor, meta)?;
            let bytes = read_bytes(cursor, len)?;
            match column {
                // TEXT 계열은 같은 타입 코드를 사용
                Some(c) if !c.is_binary() => text_or_bytes(bytes, Some(c)),
                Some(_) => CellValue::Bytes(bytes),
                None => text_or_bytes(bytes, None),
            }
        }
        ColumnType::Geometry => {
            let len = read_length(cursor, meta)?;
            CellValue::Bytes(read_bytes(cursor, len)?)
        }
        ColumnType::Json => {
            let len = read_length(cursor, meta)?;
            CellValue::Json(decode_json_binary(&read_bytes(cursor, len)?))
        }
        ColumnType::NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            CellValue::Decimal(decode_decimal(cursor, precision, scale)?)
        }
        ColumnType::Decimal => {
            return Err(CdcError::BinlogParseError(
                "Pre-5.0 DECIMAL columns are not supported".to_string(),
            ))
        }
    };

    Ok(value)
}

/// 작은 정수 타입의 부호 처리 (`width` 바이트)
fn integer(raw: u64, width: u32, unsigned: bool) -> CellValue {
    if unsigned {
        return CellValue::UInt(raw);
    }
    let shift = 64 - width * 8;
    CellValue::Int(((raw << shift) as i64) >> shift)
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// 메타데이터가 길이 필드의 바이트 수인 타입 (BLOB, JSON, GEOMETRY)
fn read_length(cursor: &mut Cursor<&[u8]>, meta: u16) -> Result<usize> {
    let width = meta.clamp(1, 4) as usize;
    Ok(cursor.read_uint::<LittleEndian>(width)? as usize)
}

fn text_or_bytes(bytes: Vec<u8>, column: Option<&ColumnInfo>) -> CellValue {
    if column.map_or(false, |c| c.is_binary()) {
        return CellValue::Bytes(bytes);
    }
    match String::from_utf8(bytes) {
        Ok(text) => CellValue::String(text),
        Err(e) => CellValue::Bytes(e.into_bytes()),
    }
}

/// STRING 메타데이터에서 실제 타입과 최대 길이 분리
///
/// 길이가 255를 넘으면 상위 비트가 타입 바이트의 0x30 비트에 뒤집혀 저장됩니다.
fn string_real_type(meta: u16) -> (u8, usize) {
    let byte0 = (meta >> 8) as u8;
    let byte1 = (meta & 0xFF) as usize;
    if byte0 & 0x30 != 0x30 {
        let length = byte1 | ((((byte0 & 0x30) ^ 0x30) as usize) << 4);
        (byte0 | 0x30, length)
    } else {
        (byte0, byte1)
    }
}

fn decode_enum(cursor: &mut Cursor<&[u8]>, width: usize, column: Option<&ColumnInfo>) -> Result<CellValue> {
    let index = cursor.read_uint::<LittleEndian>(width.clamp(1, 2))? as usize;
    let values = column.map(|c| c.enum_values.as_slice()).unwrap_or(&[]);
    Ok(match index {
        0 => CellValue::String(String::new()),
        i => match values.get(i - 1) {
            Some(v) => CellValue::String(v.clone()),
            None => CellValue::Int(i as i64),
        },
    })
}

fn decode_set(cursor: &mut Cursor<&[u8]>, width: usize, column: Option<&ColumnInfo>) -> Result<CellValue> {
    let mask = cursor.read_uint::<LittleEndian>(width.clamp(1, 8))?;
    let values = column.map(|c| c.enum_values.as_slice()).unwrap_or(&[]);
    if values.is_empty() {
        return Ok(CellValue::UInt(mask));
    }
    let selected: Vec<&str> = values
        .iter()
        .enumerate()
        .filter(|(i, _)| *i < 64 && mask & (1u64 << i) != 0)
        .map(|(_, v)| v.as_str())
        .collect();
    Ok(CellValue::String(selected.join(",")))
}

/// 소수 초 읽기 (마이크로초로 변환)
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let bytes = (fsp as usize).div_ceil(2);
    if bytes == 0 {
        return Ok(0);
    }
    let value = cursor.read_uint::<BigEndian>(bytes.min(3))? as u32;
    Ok(match bytes {
        1 => value * 10_000,
        2 => value * 100,
        _ => value,
    })
}

fn fraction_suffix(micros: u32, fsp: u8) -> String {
    if fsp == 0 {
        return String::new();
    }
    let digits = format!("{:06}", micros);
    format!(".{}", &digits[..(fsp as usize).min(6)])
}

fn timestamp(secs: i64, micros: u32, fsp: u8) -> Result<CellValue> {
    if secs == 0 && micros == 0 {
        return Ok(CellValue::DateTime(format!(
            "0000-00-00 00:00:00{}",
            fraction_suffix(0, fsp)
        )));
    }
    Utc.timestamp_opt(secs, micros * 1000)
        .single()
        .map(CellValue::Timestamp)
        .ok_or_else(|| CdcError::BinlogParseError(format!("Invalid TIMESTAMP value {}", secs)))
}

/// DATETIME2: 5바이트 big-endian (1 부호 + 17 년*13+월 + 5 일 + 5 시 + 6 분 + 6 초)
fn decode_datetime2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<CellValue> {
    let packed = cursor.read_uint::<BigEndian>(5)?;
    let micros = read_fraction(cursor, fsp)?;

    let year_month = (packed >> 22) & 0x1FFFF;
    let year = year_month / 13;
    let month = year_month % 13;
    let day = (packed >> 17) & 0x1F;
    let hour = (packed >> 12) & 0x1F;
    let minute = (packed >> 6) & 0x3F;
    let second = packed & 0x3F;

    Ok(CellValue::DateTime(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
        year,
        month,
        day,
        hour,
        minute,
        second,
        fraction_suffix(micros, fsp)
    )))
}

/// TIME2: 3바이트 big-endian (1 부호 + 1 예약 + 10 시 + 6 분 + 6 초) + 소수 초
///
/// 음수 값은 정수부와 소수부가 함께 보수로 저장되므로 24비트 소수부를 붙인 값으로 복원합니다.
fn decode_time2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<CellValue> {
    const TIME_OFFSET: i64 = 0x80_0000;

    let packed: i64 = match fsp {
        0 => (cursor.read_uint::<BigEndian>(3)? as i64 - TIME_OFFSET) << 24,
        1 | 2 => {
            let mut int_part = cursor.read_uint::<BigEndian>(3)? as i64 - TIME_OFFSET;
            let mut frac = cursor.read_u8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = cursor.read_uint::<BigEndian>(3)? as i64 - TIME_OFFSET;
            let mut frac = cursor.read_u16::<BigEndian>()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x1_0000;
            }
            (int_part << 24) + frac * 100
        }
        _ => cursor.read_uint::<BigEndian>(6)? as i64 - (TIME_OFFSET << 24),
    };

    let negative = packed < 0;
    let magnitude = packed.unsigned_abs();
    let hms = magnitude >> 24;
    let micros = (magnitude & 0xFF_FFFF) as u32;

    Ok(CellValue::Time(format!(
        "{}{:02}:{:02}:{:02}{}",
        if negative { "-" } else { "" },
        (hms >> 12) & 0x3FF,
        (hms >> 6) & 0x3F,
        hms & 0x3F,
        fraction_suffix(micros, fsp)
    )))
}

/// NEWDECIMAL: 9자리씩 4바이트로 묶은 big-endian 표현, 부호 비트 반전
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

    let int_digits = precision.saturating_sub(scale);
    let int_words = int_digits / 9;
    let int_leftover = int_digits % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;

    let int_leftover_bytes = DIG2BYTES[int_leftover];
    let frac_leftover_bytes = DIG2BYTES[frac_leftover];
    let total = int_leftover_bytes + int_words * 4 + frac_words * 4 + frac_leftover_bytes;
    if total == 0 {
        return Err(CdcError::BinlogParseError(format!(
            "Invalid DECIMAL({}, {})",
            precision, scale
        )));
    }

    let mut bytes = read_bytes(cursor, total)?;
    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut digits = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();

    if int_leftover_bytes > 0 {
        let value = digits.read_uint::<BigEndian>(int_leftover_bytes)?;
        if value > 0 {
            int_part.push_str(&value.to_string());
        }
    }
    for _ in 0..int_words {
        let value = digits.read_u32::<BigEndian>()?;
        if int_part.is_empty() {
            if value > 0 {
                int_part.push_str(&value.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", value));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            let value = digits.read_u32::<BigEndian>()?;
            result.push_str(&format!("{:09}", value));
        }
        if frac_leftover_bytes > 0 {
            let value = digits.read_uint::<BigEndian>(frac_leftover_bytes)?;
            result.push_str(&format!("{:0width$}", value, width = frac_leftover));
        }
    }

    Ok(result)
}

// MySQL binary JSON
//
// 타입 바이트:
//   0x00/0x01 = small/large object, 0x02/0x03 = small/large array,
//   0x04 = literal, 0x05..0x0a = int16/uint16/int32/uint32/int64/uint64,
//   0x0b = double, 0x0c = utf8 string, 0x0f = opaque

/// binary JSON → `serde_json::Value`. 해석할 수 없으면 텍스트 JSON으로 시도
pub fn decode_json_binary(data: &[u8]) -> serde_json::Value {
    if data.is_empty() {
        return serde_json::Value::Null;
    }
    match json_value(data[0], &data[1..]) {
        Ok(value) => value,
        Err(_) => serde_json::from_slice(data).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(data).into_owned())
        }),
    }
}

fn json_err(msg: &str) -> CdcError {
    CdcError::BinlogParseError(format!("Malformed JSON column: {}", msg))
}

fn le_bytes<const N: usize>(data: &[u8], at: usize) -> Result<[u8; N]> {
    data.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| json_err("truncated value"))
}

fn json_value(type_byte: u8, data: &[u8]) -> Result<serde_json::Value> {
    use serde_json::json;

    let value = match type_byte {
        0x00 => json_container(data, false, true)?,
        0x01 => json_container(data, true, true)?,
        0x02 => json_container(data, false, false)?,
        0x03 => json_container(data, true, false)?,
        0x04 => json_literal(data.first().copied().unwrap_or(0) as u16),
        0x05 => json!(i16::from_le_bytes(le_bytes(data, 0)?)),
        0x06 => json!(u16::from_le_bytes(le_bytes(data, 0)?)),
        0x07 => json!(i32::from_le_bytes(le_bytes(data, 0)?)),
        0x08 => json!(u32::from_le_bytes(le_bytes(data, 0)?)),
        0x09 => json!(i64::from_le_bytes(le_bytes(data, 0)?)),
        0x0a => json!(u64::from_le_bytes(le_bytes(data, 0)?)),
        0x0b => json!(f64::from_le_bytes(le_bytes(data, 0)?)),
        0x0c => {
            let (len, prefix) = json_var_length(data)?;
            let raw = data
                .get(prefix..prefix + len)
                .ok_or_else(|| json_err("truncated string"))?;
            serde_json::Value::String(String::from_utf8_lossy(raw).into_owned())
        }
        0x0f => {
            // 타입 코드 1바이트 + 길이 + 원시 값
            let rest = data.get(1..).ok_or_else(|| json_err("truncated opaque"))?;
            let (len, prefix) = json_var_length(rest)?;
            let raw = rest
                .get(prefix..prefix + len)
                .ok_or_else(|| json_err("truncated opaque"))?;
            match std::str::from_utf8(raw) {
                Ok(text) => serde_json::Value::String(text.to_string()),
                Err(_) => {
                    use base64::Engine;
                    serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(raw))
                }
            }
        }
        other => return Err(json_err(&format!("unknown type 0x{:02x}", other))),
    };
    Ok(value)
}

fn json_literal(code: u16) -> serde_json::Value {
    match code {
        0x01 => serde_json::Value::Bool(true),
        0x02 => serde_json::Value::Bool(false),
        _ => serde_json::Value::Null,
    }
}

fn json_offset(data: &[u8], at: usize, large: bool) -> Result<usize> {
    Ok(if large {
        u32::from_le_bytes(le_bytes(data, at)?) as usize
    } else {
        u16::from_le_bytes(le_bytes(data, at)?) as usize
    })
}

fn json_container(data: &[u8], large: bool, is_object: bool) -> Result<serde_json::Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = json_offset(data, 0, large)?;
    let header = offset_size * 2;
    let key_entry = offset_size + 2;
    let value_entry = offset_size + 1;
    let value_entries = if is_object {
        header + count * key_entry
    } else {
        header
    };

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let at = value_entries + i * value_entry;
        let type_byte = *data.get(at).ok_or_else(|| json_err("truncated value entry"))?;
        values.push(json_entry(data, type_byte, at + 1, large)?);
    }

    if !is_object {
        return Ok(serde_json::Value::Array(values));
    }

    let mut map = serde_json::Map::with_capacity(count);
    for (i, value) in values.into_iter().enumerate() {
        let at = header + i * key_entry;
        let key_offset = json_offset(data, at, large)?;
        let key_len = u16::from_le_bytes(le_bytes(data, at + offset_size)?) as usize;
        let key = data
            .get(key_offset..key_offset + key_len)
            .ok_or_else(|| json_err("truncated key"))?;
        map.insert(String::from_utf8_lossy(key).into_owned(), value);
    }
    Ok(serde_json::Value::Object(map))
}

/// 값 엔트리 해석. 작은 스칼라는 오프셋 자리에 직접 저장됨
fn json_entry(data: &[u8], type_byte: u8, at: usize, large: bool) -> Result<serde_json::Value> {
    use serde_json::json;

    match type_byte {
        0x04 => return Ok(json_literal(u16::from_le_bytes(le_bytes(data, at)?))),
        0x05 => return Ok(json!(i16::from_le_bytes(le_bytes(data, at)?))),
        0x06 => return Ok(json!(u16::from_le_bytes(le_bytes(data, at)?))),
        0x07 if large => return Ok(json!(i32::from_le_bytes(le_bytes(data, at)?))),
        0x08 if large => return Ok(json!(u32::from_le_bytes(le_bytes(data, at)?))),
        _ => {}
    }

    let offset = json_offset(data, at, large)?;
    let nested = data
        .get(offset..)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| json_err("value offset out of bounds"))?;
    json_value(type_byte, nested)
}

/// 7비트씩 나뉜 가변 길이 정수 (최대 5바이트)
fn json_var_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = 0usize;
    for i in 0..5 {
        let b = *data.get(i).ok_or_else(|| json_err("truncated length"))? as usize;
        length |= (b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(json_err("length prefix too long"))
}
