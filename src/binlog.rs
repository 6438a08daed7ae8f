//! MySQL Binlog 이벤트 파싱
//!
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - CRC32 (4 bytes, 체크섬이 켜진 경우)
//!
//! 행 이벤트는 바로 앞의 TABLE_MAP 이벤트가 등록한 컬럼 타입으로만 해석할 수 있으므로
//! `BinlogDecoder`가 table id → 테이블 맵을 보관합니다.

use crate::column::{decode_cell, read_metadata, ColumnInfo};
use crate::error::{CdcError, Result};
use crate::events::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, trace};

pub const EVENT_HEADER_SIZE: usize = 19;
pub const CHECKSUM_SIZE: usize = 4;

/// 문장의 마지막 행 이벤트 (이후 테이블 맵이 해제됨)
pub const STMT_END_F: u16 = 0x0001;
/// 서버가 만든 가상 이벤트 (파일에 없음)
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x0020;

/// ROTATE 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEventData {
    pub next_binlog_name: String,
    pub position: u64,
}

/// QUERY 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEventData {
    pub thread_id: u32,
    pub exec_time: u32,
    pub database: String,
    pub query: String,
}

/// FORMAT_DESCRIPTION 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
}

/// 디코딩된 행 이벤트
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEventData {
    pub table_id: u64,
    pub flags: u16,
    pub body: NotificationBody,
}

impl RowsEventData {
    pub fn is_statement_end(&self) -> bool {
        self.flags & STMT_END_F != 0
    }
}

/// 디코딩된 binlog 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionData),
    Rotate(RotateEventData),
    Query(QueryEventData),
    TableMap(TableMapData),
    Rows(RowsEventData),
    Xid(u64),
    Other,
}

/// 상태 없는 이벤트 본문 파서
pub struct BinlogParser;

impl BinlogParser {
    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(CdcError::BinlogParseError(
                "Invalid event header: too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let event_type = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(event_type),
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    /// FORMAT_DESCRIPTION 이벤트 파싱 (15)
    pub fn parse_format_description(data: &[u8]) -> Result<FormatDescriptionData> {
        if data.len() < 52 {
            return Err(CdcError::BinlogParseError(
                "Invalid format description event".to_string(),
            ));
        }

        let binlog_version = u16::from_le_bytes([data[0], data[1]]);
        let version_bytes = &data[2..52];
        let end = version_bytes.iter().position(|&b| b == 0).unwrap_or(version_bytes.len());
        let server_version = String::from_utf8_lossy(&version_bytes[..end]).to_string();

        Ok(FormatDescriptionData {
            binlog_version,
            server_version,
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        if data.len() < 8 {
            return Err(CdcError::BinlogParseError(
                "Invalid rotate event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);
        let position = cursor.read_u64::<LittleEndian>()?;
        let next_binlog_name = String::from_utf8_lossy(&data[8..]).to_string();

        Ok(RotateEventData {
            next_binlog_name,
            position,
        })
    }

    /// QUERY 이벤트 파싱 (2)
    pub fn parse_query_event(data: &[u8]) -> Result<QueryEventData> {
        if data.len() < 13 {
            return Err(CdcError::BinlogParseError(
                "Invalid query event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let thread_id = cursor.read_u32::<LittleEndian>()?;
        let exec_time = cursor.read_u32::<LittleEndian>()?;
        let db_len = cursor.read_u8()? as usize;
        let _error_code = cursor.read_u16::<LittleEndian>()?;
        let status_len = cursor.read_u16::<LittleEndian>()? as usize;

        // Status variables skip
        cursor.set_position(cursor.position() + status_len as u64);

        let mut db_bytes = vec![0u8; db_len];
        cursor.read_exact(&mut db_bytes)?;
        let database = String::from_utf8_lossy(&db_bytes).to_string();

        // null terminator
        cursor.read_u8()?;

        let query = String::from_utf8_lossy(&data[cursor.position() as usize..]).to_string();

        Ok(QueryEventData {
            thread_id,
            exec_time,
            database,
            query,
        })
    }

    /// XID 이벤트 파싱 (16)
    pub fn parse_xid_event(data: &[u8]) -> Result<u64> {
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_u64::<LittleEndian>()?)
    }

    /// 테이블 맵 이벤트 파싱 (19)
    pub fn parse_table_map_event(data: &[u8]) -> Result<TableMapData> {
        if data.len() < 8 {
            return Err(CdcError::BinlogParseError(
                "Invalid table map event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let table_id = cursor.read_u48::<LittleEndian>()?;
        let _flags = cursor.read_u16::<LittleEndian>()?;

        let database = read_name(&mut cursor)?;
        let table = read_name(&mut cursor)?;

        let column_count = read_lcb(&mut cursor)?;
        let column_count = checked_len(&cursor, column_count, "Column count")?;
        let mut column_types = vec![0u8; column_count];
        cursor.read_exact(&mut column_types)?;

        // 메타데이터 블록은 타입별 가변 길이
        let metadata_len = read_lcb(&mut cursor)?;
        let metadata_len = checked_len(&cursor, metadata_len, "Table map metadata")?;
        let mut metadata = vec![0u8; metadata_len];
        cursor.read_exact(&mut metadata)?;

        let mut meta_cursor = Cursor::new(metadata.as_slice());
        let column_meta = column_types
            .iter()
            .map(|ty| read_metadata(&mut meta_cursor, *ty))
            .collect::<Result<Vec<u16>>>()?;

        let mut nullable_bitmap = vec![0u8; column_count.div_ceil(8)];
        cursor.read_exact(&mut nullable_bitmap)?;

        // 이후의 optional metadata (binlog_row_metadata=FULL)는 사용하지 않음

        Ok(TableMapData {
            table_id,
            database,
            table,
            column_types,
            column_meta,
            nullable_bitmap,
        })
    }
}

/// 길이 바이트 + 이름 + NUL
fn read_name(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    cursor.read_u8()?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// LCB (Length-Coded Binary) 읽기
fn read_lcb(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfb => Ok(0),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => Ok(cursor.read_u64::<LittleEndian>()?),
        0xff => Err(CdcError::BinlogParseError("Invalid LCB value".to_string())),
    }
}

/// 남은 바이트보다 큰 길이 값은 손상된 이벤트
fn checked_len(cursor: &Cursor<&[u8]>, len: u64, what: &str) -> Result<usize> {
    let total = cursor.get_ref().len() as u64;
    let remaining = total.saturating_sub(cursor.position());
    if len > remaining {
        return Err(CdcError::BinlogParseError(format!(
            "{} {} exceeds the {} bytes left in the event",
            what, len, remaining
        )));
    }
    Ok(len as usize)
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map_or(false, |byte| byte & (1 << (idx % 8)) != 0)
}

fn count_set_bits(bitmap: &[u8], limit: usize) -> usize {
    (0..limit).filter(|i| is_bit_set(bitmap, *i)).count()
}

/// 행 이벤트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowsKind {
    Write,
    Update,
    Delete,
}

/// 연결 하나 동안 유지되는 binlog 디코더
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    checksum: bool,
    tables: HashMap<u64, TableMapData>,
    /// `schema.table` → 컬럼 정보
    schemas: HashMap<String, Vec<ColumnInfo>>,
}

impl BinlogDecoder {
    pub fn new(checksum: bool) -> Self {
        BinlogDecoder {
            checksum,
            ..Default::default()
        }
    }

    /// 컬럼 이름/부호 정보 등록
    pub fn register_schema(&mut self, table: impl Into<String>, columns: Vec<ColumnInfo>) {
        self.schemas.insert(table.into(), columns);
    }

    pub fn has_schema(&self, table: &str) -> bool {
        self.schemas.contains_key(table)
    }

    /// 이벤트 하나 디코딩 (OK 바이트 제외)
    pub fn decode(&mut self, data: &[u8]) -> Result<(EventHeader, BinlogEvent)> {
        let header = BinlogParser::parse_header(data)?;

        let end = if self.checksum {
            data.len()
                .checked_sub(CHECKSUM_SIZE)
                .filter(|end| *end >= EVENT_HEADER_SIZE)
                .ok_or_else(|| {
                    CdcError::BinlogParseError("Event shorter than its checksum".to_string())
                })?
        } else {
            data.len()
        };
        let body = &data[EVENT_HEADER_SIZE..end];

        trace!(event_type = ?header.event_type, len = body.len(), "Decoding event");

        let event = match header.event_type {
            EventType::FormatDescriptionEvent => {
                BinlogEvent::FormatDescription(BinlogParser::parse_format_description(body)?)
            }
            EventType::RotateEvent => BinlogEvent::Rotate(BinlogParser::parse_rotate_event(body)?),
            EventType::QueryEvent => BinlogEvent::Query(BinlogParser::parse_query_event(body)?),
            EventType::XidEvent => BinlogEvent::Xid(BinlogParser::parse_xid_event(body)?),
            EventType::TableMapEvent => {
                let table_map = BinlogParser::parse_table_map_event(body)?;
                debug!(
                    table_id = table_map.table_id,
                    table = %table_map.full_name(),
                    columns = table_map.column_types.len(),
                    "Registered table map"
                );
                self.tables.insert(table_map.table_id, table_map.clone());
                BinlogEvent::TableMap(table_map)
            }
            EventType::WriteRowsEvent | EventType::WriteRowsEventV1 => {
                BinlogEvent::Rows(self.decode_rows(body, RowsKind::Write, header.event_type)?)
            }
            EventType::UpdateRowsEvent | EventType::UpdateRowsEventV1 => {
                BinlogEvent::Rows(self.decode_rows(body, RowsKind::Update, header.event_type)?)
            }
            EventType::DeleteRowsEvent | EventType::DeleteRowsEventV1 => {
                BinlogEvent::Rows(self.decode_rows(body, RowsKind::Delete, header.event_type)?)
            }
            _ => BinlogEvent::Other,
        };

        Ok((header, event))
    }

    fn decode_rows(&self, data: &[u8], kind: RowsKind, event_type: EventType) -> Result<RowsEventData> {
        let mut cursor = Cursor::new(data);

        let table_id = cursor.read_u48::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        // v2 이벤트: extra data 길이에 자기 자신 2바이트 포함
        if matches!(
            event_type,
            EventType::WriteRowsEvent | EventType::UpdateRowsEvent | EventType::DeleteRowsEvent
        ) {
            let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
            cursor.set_position(cursor.position() + extra_len.saturating_sub(2));
        }

        let column_count = read_lcb(&mut cursor)?;
        let bitmap_len = checked_len(&cursor, column_count.div_ceil(8), "Column bitmap")?;
        let column_count = column_count as usize;

        let mut present = vec![0u8; bitmap_len];
        cursor.read_exact(&mut present)?;

        let after_present = if kind == RowsKind::Update {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap)?;
            bitmap
        } else {
            present.clone()
        };

        let table = self.tables.get(&table_id).ok_or_else(|| {
            CdcError::BinlogParseError(format!("Rows event for unknown table id {}", table_id))
        })?;
        let full_name = table.full_name();
        let columns = self
            .schemas
            .get(&full_name)
            .map(|c| c.as_slice())
            .unwrap_or(&[]);

        let reader = RowReader {
            table,
            columns,
            column_count,
        };

        let body = match kind {
            RowsKind::Write | RowsKind::Delete => {
                let mut rows = Vec::new();
                while (cursor.position() as usize) < data.len() {
                    let start = cursor.position();
                    rows.push(reader.read_row(&mut cursor, &present)?);
                    ensure_progress(&cursor, start)?;
                }
                let notification = RowsNotification {
                    table: full_name,
                    rows,
                };
                if kind == RowsKind::Write {
                    NotificationBody::WriteRows(notification)
                } else {
                    NotificationBody::DeleteRows(notification)
                }
            }
            RowsKind::Update => {
                let mut rows = Vec::new();
                while (cursor.position() as usize) < data.len() {
                    let start = cursor.position();
                    let before = reader.read_row(&mut cursor, &present)?;
                    let after = reader.read_row(&mut cursor, &after_present)?;
                    ensure_progress(&cursor, start)?;
                    rows.push(RowChange { before, after });
                }
                NotificationBody::UpdateRows(UpdateRowsNotification {
                    table: full_name,
                    rows,
                })
            }
        };

        Ok(RowsEventData {
            table_id,
            flags,
            body,
        })
    }
}

/// 빈 행 이미지가 남은 바이트를 소비하지 못하면 무한 반복이 됨
fn ensure_progress(cursor: &Cursor<&[u8]>, start: u64) -> Result<()> {
    if cursor.position() == start {
        return Err(CdcError::BinlogParseError(
            "Row image consumed no bytes; rows event is malformed".to_string(),
        ));
    }
    Ok(())
}

/// 테이블 맵과 스키마로 행 이미지 하나를 읽음
struct RowReader<'a> {
    table: &'a TableMapData,
    columns: &'a [ColumnInfo],
    column_count: usize,
}

impl RowReader<'_> {
    fn read_row(&self, cursor: &mut Cursor<&[u8]>, present: &[u8]) -> Result<Row> {
        let present_count = count_set_bits(present, self.column_count);
        let mut null_bitmap = vec![0u8; present_count.div_ceil(8)];
        cursor.read_exact(&mut null_bitmap)?;

        let mut row = Row::with_capacity(present_count);
        let mut null_idx = 0;

        for idx in 0..self.column_count {
            if !is_bit_set(present, idx) {
                continue;
            }

            let column = self.columns.get(idx);
            let value = if is_bit_set(&null_bitmap, null_idx) {
                CellValue::Null
            } else {
                let column_type = *self.table.column_types.get(idx).ok_or_else(|| {
                    CdcError::BinlogParseError(format!(
                        "Column {} missing from table map of {}",
                        idx,
                        self.table.full_name()
                    ))
                })?;
                let meta = self.table.column_meta.get(idx).copied().unwrap_or(0);
                decode_cell(cursor, column_type, meta, column)?
            };
            null_idx += 1;

            let name = match column {
                Some(c) => c.name.clone(),
                None => format!("col{}", idx),
            };
            row.insert(name, value);
        }

        Ok(row)
    }
}
