//! MySQL Binlog CDC (Change Data Capture) 핵심 구현
//!
//! 이 라이브러리는 MySQL 바이너리 로그를 읽어 데이터 변경 사항을 추적합니다.
//! 주요 기능:
//! - Binlog 복제 프로토콜 및 이벤트 파싱
//! - 행 변경 알림을 Insert/Update/Delete 이벤트로 분류
//! - 연결 관리, 재연결 및 재시작 위치 추적

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod classifier;
pub mod column;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod events;
pub mod offset;
pub mod protocol;
pub mod resolver;
pub mod runner;
pub mod sink;
pub mod source;

#[cfg(test)]
mod testing;

pub use binlog_client::{BinlogClient, MySqlSource};
pub use classifier::classify;
pub use config::{ConnectionProfile, ProfileFields};
pub use controller::{StreamCloser, StreamController, StreamOptions, StreamState};
pub use error::{CdcError, Result};
pub use events::{CellValue, ChangeEvent, EventType, RawNotification, Row};
pub use offset::BinlogPosition;
pub use resolver::resolve_latest;
pub use runner::run_to_sink;
pub use sink::{ConsoleSink, EventSink, OutputFormat};
pub use source::{NotificationStream, ReplicationSource, SegmentCatalog};
