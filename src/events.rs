//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의
//!
//! 두 계층으로 나뉩니다.
//! - 원시 알림(`RawNotification`): 어댑터가 binlog 이벤트 하나를 디코딩한 결과
//! - 도메인 이벤트(`ChangeEvent`): 분류기가 만든 Insert/Update/Delete

use crate::offset::BinlogPosition;
use base64::Engine;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    #[default]
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent = 2,
    /// 서버 종료
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 디스크립션 (파일 시작)
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    /// WRITE_ROWS v1 (INSERT, MySQL 5.1~5.5)
    WriteRowsEventV1 = 23,
    /// UPDATE_ROWS v1
    UpdateRowsEventV1 = 24,
    /// DELETE_ROWS v1
    DeleteRowsEventV1 = 25,
    /// 하트비트 (유휴 상태에서 서버가 전송)
    HeartbeatEvent = 27,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    /// 이전 GTID 집합
    PreviousGtidsEvent = 35,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 29,
    /// 트랜잭션 페이로드 이벤트
    TransactionPayloadEvent = 40,
    /// 하트비트 v2 (MySQL 8.0.26+)
    HeartbeatEventV2 = 41,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            29 => EventType::RowsQueryEvent,
            35 => EventType::PreviousGtidsEvent,
            40 => EventType::TransactionPayloadEvent,
            41 => EventType::HeartbeatEventV2,
            _ => EventType::Unknown,
        }
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    pub column_types: Vec<u8>,
    /// 컬럼별 타입 메타데이터 (길이, 정밀도 등)
    pub column_meta: Vec<u16>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
}

impl TableMapData {
    /// `schema.table` 형식의 이름
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// 셀 값 (스칼라 또는 NULL)
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date(String),
    Time(String),
    /// 타임존 없는 DATETIME
    DateTime(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::String(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::String(v)
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_none(),
            CellValue::Int(v) => serializer.serialize_i64(*v),
            CellValue::UInt(v) => serializer.serialize_u64(*v),
            CellValue::Float(v) => serializer.serialize_f32(*v),
            CellValue::Double(v) => serializer.serialize_f64(*v),
            CellValue::Decimal(s)
            | CellValue::String(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::DateTime(s) => serializer.serialize_str(s),
            CellValue::Bytes(b) => serializer
                .serialize_str(&base64::engine::general_purpose::STANDARD.encode(b)),
            CellValue::Timestamp(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            CellValue::Json(v) => v.serialize(serializer),
        }
    }
}

/// 컬럼명 → 값 (컬럼 순서 유지)
pub type Row = IndexMap<String, CellValue>;

/// UPDATE 한 행의 변경 전후 이미지
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub before: Row,
    pub after: Row,
}

/// WRITE_ROWS / DELETE_ROWS 알림 본문
#[derive(Debug, Clone, PartialEq)]
pub struct RowsNotification {
    /// `schema.table`
    pub table: String,
    pub rows: Vec<Row>,
}

/// UPDATE_ROWS 알림 본문
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRowsNotification {
    /// `schema.table`
    pub table: String,
    pub rows: Vec<RowChange>,
}

/// 어댑터가 전달하는 알림 종류 (닫힌 집합)
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationBody {
    WriteRows(RowsNotification),
    UpdateRows(UpdateRowsNotification),
    DeleteRows(RowsNotification),
    /// DDL, 하트비트, 로테이션 등 행 변경이 아닌 이벤트
    Other(EventType),
}

/// binlog 이벤트 하나에 대한 원시 알림
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub header: EventHeader,
    pub body: NotificationBody,
    /// 이 알림을 다시 받으려면 재연결해야 하는 위치 (테이블 맵 포함)
    pub checkpoint: BinlogPosition,
    /// 이 알림을 모두 처리한 뒤 재연결에 안전한 위치
    pub resume_after: BinlogPosition,
}

impl RawNotification {
    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }
}

/// CDC 변경 이벤트 (application-level view)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert { table: String, row: Row },
    Update { table: String, before: Row, after: Row },
    Delete { table: String, row: Row },
}

impl ChangeEvent {
    /// `schema.table`
    pub fn table(&self) -> &str {
        match self {
            ChangeEvent::Insert { table, .. }
            | ChangeEvent::Update { table, .. }
            | ChangeEvent::Delete { table, .. } => table,
        }
    }

    pub fn op(&self) -> OperationType {
        match self {
            ChangeEvent::Insert { .. } => OperationType::Insert,
            ChangeEvent::Update { .. } => OperationType::Update,
            ChangeEvent::Delete { .. } => OperationType::Delete,
        }
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_from_u8() {
        assert_eq!(EventType::from_u8(30), EventType::WriteRowsEvent);
        assert_eq!(EventType::from_u8(24), EventType::UpdateRowsEventV1);
        assert_eq!(EventType::from_u8(27), EventType::HeartbeatEvent);
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
    }

    #[test]
    fn test_change_event_json_shape() {
        let mut row = Row::new();
        row.insert("id".to_string(), CellValue::Int(4));
        row.insert("name".to_string(), "John".into());
        row.insert("nickname".to_string(), CellValue::Null);

        let event = ChangeEvent::Insert {
            table: "d.users".to_string(),
            row,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "insert", "table": "d.users", "row": {"id": 4, "name": "John", "nickname": null}})
        );
        assert_eq!(event.op().as_str(), "INSERT");
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let value = serde_json::to_value(CellValue::Bytes(vec![0xde, 0xad])).unwrap();
        assert_eq!(value, json!("3q0="));
    }

    #[test]
    fn test_row_preserves_column_order() {
        let mut row = Row::new();
        row.insert("z".to_string(), CellValue::Int(1));
        row.insert("a".to_string(), CellValue::Int(2));
        let text = serde_json::to_string(&row).unwrap();
        assert_eq!(text, r#"{"z":1,"a":2}"#);
    }
}
