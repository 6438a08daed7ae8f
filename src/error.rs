//! CDC 관련 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    /// 연결 프로필 검증 실패 (재시도 대상 아님)
    #[error("설정 검증 에러: {0}")]
    ValidationError(String),

    /// 관리용 연결 또는 복제 연결 수립 실패
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    /// 열린 스트림 핸들이 필요한 작업을 연결 없이 호출함
    #[error("스트림이 연결되어 있지 않습니다")]
    NotConnected,

    /// 스트리밍 도중 어댑터 오류 (서버 연결 끊김 등)
    #[error("스트림 읽기 에러: {0}")]
    StreamRead(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CdcError {
    /// 스트리밍 단계에서 발생한 에러를 `StreamRead`로 통일
    pub fn into_stream_read(self) -> Self {
        match self {
            CdcError::StreamRead(_) => self,
            other => CdcError::StreamRead(other.to_string()),
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_stream_read_wraps_other_errors() {
        let err = CdcError::BinlogParseError("truncated".to_string()).into_stream_read();
        match err {
            CdcError::StreamRead(msg) => assert!(msg.contains("truncated")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_into_stream_read_keeps_stream_read() {
        let err = CdcError::StreamRead("reset".to_string()).into_stream_read();
        assert_eq!(err.to_string(), "스트림 읽기 에러: reset");
    }
}
