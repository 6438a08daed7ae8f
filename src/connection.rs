//! MySQL 관리용 연결 (binlog 목록, 체크섬 설정, 테이블 스키마 조회)

use crate::column::ColumnInfo;
use crate::config::ConnectionProfile;
use crate::error::{CdcError, Result};
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Row};
use tracing::{debug, warn};

/// 연결 직후 실행할 문자셋 설정 구문
pub fn set_names_statement(profile: &ConnectionProfile) -> String {
    format!(
        "SET NAMES {} COLLATE {}",
        profile.charset(),
        profile.collation()
    )
}

fn build_opts(profile: &ConnectionProfile) -> OptsBuilder {
    OptsBuilder::default()
        .ip_or_hostname(profile.host())
        .tcp_port(profile.port())
        .user(Some(profile.user()))
        .pass(Some(profile.password()))
        .db_name(Some(profile.database()))
        .init(vec![set_names_statement(profile)])
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(profile: &ConnectionProfile) -> Result<Self> {
        debug!(host = %profile.host(), port = profile.port(), "Opening admin connection");
        let conn = Conn::new(build_opts(profile))
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        Ok(MySqlConnection { conn })
    }

    /// 서버에 남아 있는 binlog 파일 목록 (오래된 순)
    pub async fn list_binary_logs(&mut self) -> Result<Vec<String>> {
        // 서버 버전에 따라 컬럼 수가 다름 (Log_name, File_size[, Encrypted])
        let rows: Vec<Row> = self
            .conn
            .query("SHOW BINARY LOGS")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to list binary logs: {}", e)))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.get::<String, _>(0))
            .collect())
    }

    /// 서버의 binlog 체크섬 알고리즘 (`NONE` 또는 `CRC32`)
    pub async fn binlog_checksum(&mut self) -> Result<String> {
        let value: Option<String> = self
            .conn
            .query_first("SELECT @@global.binlog_checksum")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query binlog_checksum: {}", e)))?;

        Ok(value.unwrap_or_else(|| "NONE".to_string()))
    }

    /// 테이블 스키마 조회
    pub async fn get_table_schema(&mut self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let result: Vec<(String, String)> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        Ok(result
            .into_iter()
            .map(|(name, column_type)| ColumnInfo::from_definition(name, column_type))
            .collect())
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to disconnect: {}", e)))
    }
}

/// 관리용 연결 하나로 binlog 목록 조회. 실패해도 연결은 닫습니다.
pub async fn list_binary_logs(profile: &ConnectionProfile) -> Result<Vec<String>> {
    let mut conn = MySqlConnection::connect(profile).await?;
    let listed = conn.list_binary_logs().await;
    if let Err(e) = conn.close().await {
        warn!("Admin connection did not close cleanly: {}", e);
    }
    listed
}
