//! Binlog 처리 위치 추적
//!
//! Binlog 파일명 + 위치로 재시작 지점을 표현합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치 → `mysql-bin.000003:4097`

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 모든 binlog 파일은 4 바이트 매직 헤더 다음부터 이벤트가 시작됨
pub const BINLOG_START_POSITION: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일의 첫 이벤트 위치
    pub fn start_of(filename: impl Into<String>) -> Self {
        Self::new(filename, BINLOG_START_POSITION)
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

impl FromStr for BinlogPosition {
    type Err = CdcError;

    /// `file:offset` 또는 `file` (offset 4) 형식
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CdcError::ValidationError(
                "Binlog position cannot be empty".to_string(),
            ));
        }

        match s.rsplit_once(':') {
            Some((file, offset)) if !file.is_empty() => {
                let position = offset.parse::<u64>().map_err(|_| {
                    CdcError::ValidationError(format!("Invalid binlog offset: {}", offset))
                })?;
                Ok(BinlogPosition::new(file, position))
            }
            Some(_) => Err(CdcError::ValidationError(format!(
                "Missing binlog file name: {}",
                s
            ))),
            None => Ok(BinlogPosition::start_of(s)),
        }
    }
}
