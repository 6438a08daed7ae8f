//! 복제 프로토콜 어댑터 경계
//!
//! 컨트롤러는 이 트레이트들만 알고 있습니다. 실제 MySQL 구현은
//! [`crate::binlog_client::MySqlSource`]에 있습니다.

use crate::config::ConnectionProfile;
use crate::error::Result;
use crate::events::RawNotification;
use crate::offset::BinlogPosition;
use async_trait::async_trait;

/// 서버에 보존된 binlog 파일 목록 조회
#[async_trait]
pub trait SegmentCatalog: Send + Sync {
    /// 오래된 순서대로 정렬된 파일명 목록
    async fn list_segments(&self, profile: &ConnectionProfile) -> Result<Vec<String>>;
}

/// 주어진 위치부터 원시 알림 스트림을 여는 어댑터
#[async_trait]
pub trait ReplicationSource: SegmentCatalog {
    type Stream: NotificationStream;

    async fn open(
        &self,
        profile: &ConnectionProfile,
        server_id: u32,
        position: &BinlogPosition,
    ) -> Result<Self::Stream>;
}

/// 열린 복제 연결
#[async_trait]
pub trait NotificationStream: Send {
    /// 다음 알림까지 대기. `Ok(None)`은 서버가 스트림을 닫았다는 뜻
    async fn next_notification(&mut self) -> Result<Option<RawNotification>>;

    /// 연결 해제 (여러 번 호출해도 안전)
    async fn close(&mut self) -> Result<()>;
}
