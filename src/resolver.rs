//! 재시작 위치 결정
//!
//! 위치가 주어지지 않으면 서버에 남아 있는 가장 최근 binlog 파일의 처음부터 읽습니다.

use crate::config::ConnectionProfile;
use crate::error::Result;
use crate::offset::BinlogPosition;
use crate::source::SegmentCatalog;
use tracing::{debug, info};

/// 가장 최근 binlog 파일의 시작 위치. 파일이 없으면 `None`
///
/// 관리용 연결은 카탈로그 구현이 열고 닫습니다. 실패 시 재시도하지 않습니다.
pub async fn resolve_latest<C>(catalog: &C, profile: &ConnectionProfile) -> Result<Option<BinlogPosition>>
where
    C: SegmentCatalog + ?Sized,
{
    let segments = catalog.list_segments(profile).await?;
    debug!(count = segments.len(), "Listed retained binlog segments");

    let latest = latest_segment(&segments);
    match &latest {
        Some(position) => info!(%position, "Resolved latest binlog position"),
        None => info!("Server reported no binlog segments"),
    }
    Ok(latest)
}

/// 정렬된 목록의 마지막 항목 선택
pub fn latest_segment(segments: &[String]) -> Option<BinlogPosition> {
    segments.last().map(BinlogPosition::start_of)
}
