//! 테스트용 메모리 어댑터와 알림 생성 헬퍼

use crate::config::{ConnectionProfile, ProfileFields};
use crate::error::{CdcError, Result};
use crate::events::{
    CellValue, EventHeader, EventType, NotificationBody, RawNotification, Row, RowChange,
    RowsNotification, UpdateRowsNotification,
};
use crate::offset::BinlogPosition;
use crate::source::{NotificationStream, ReplicationSource, SegmentCatalog};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_FILE: &str = "mysql-bin.000001";

pub fn profile() -> ConnectionProfile {
    ConnectionProfile::construct(ProfileFields::new("u", "p", "h", "d")).unwrap()
}

pub fn row(columns: &[(&str, CellValue)]) -> Row {
    columns
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn notification(event_type: EventType, body: NotificationBody) -> RawNotification {
    RawNotification {
        header: EventHeader {
            event_type,
            ..Default::default()
        },
        body,
        checkpoint: BinlogPosition::start_of(TEST_FILE),
        resume_after: BinlogPosition::start_of(TEST_FILE),
    }
}

pub fn write_rows(table: &str, rows: Vec<Row>) -> RawNotification {
    notification(
        EventType::WriteRowsEvent,
        NotificationBody::WriteRows(RowsNotification {
            table: table.to_string(),
            rows,
        }),
    )
}

pub fn update_rows(table: &str, rows: Vec<(Row, Row)>) -> RawNotification {
    notification(
        EventType::UpdateRowsEvent,
        NotificationBody::UpdateRows(UpdateRowsNotification {
            table: table.to_string(),
            rows: rows
                .into_iter()
                .map(|(before, after)| RowChange { before, after })
                .collect(),
        }),
    )
}

pub fn delete_rows(table: &str, rows: Vec<Row>) -> RawNotification {
    notification(
        EventType::DeleteRowsEvent,
        NotificationBody::DeleteRows(RowsNotification {
            table: table.to_string(),
            rows,
        }),
    )
}

pub fn other(event_type: EventType) -> RawNotification {
    notification(event_type, NotificationBody::Other(event_type))
}

/// 알림의 재시작 위치를 지정
pub fn positioned(mut n: RawNotification, checkpoint: u64, resume_after: u64) -> RawNotification {
    n.checkpoint = BinlogPosition::new(TEST_FILE, checkpoint);
    n.resume_after = BinlogPosition::new(TEST_FILE, resume_after);
    n
}

/// 스크립트 한 단계
#[derive(Debug, Clone)]
pub enum Step {
    Deliver(RawNotification),
    /// 다음 단계 전에 대기 (느린 네트워크)
    Stall(Duration),
    Fail(String),
    End,
}

#[derive(Debug, Default)]
struct ProbeCounters {
    segment_lookups: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    opened_at: Mutex<Vec<BinlogPosition>>,
}

/// 어댑터 호출 기록
#[derive(Debug, Clone, Default)]
pub struct Probe(Arc<ProbeCounters>);

impl Probe {
    pub fn segment_lookups(&self) -> usize {
        self.0.segment_lookups.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.0.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    pub fn opened_at(&self) -> Vec<BinlogPosition> {
        self.0.opened_at.lock().unwrap().clone()
    }
}

/// 연결마다 준비된 스크립트를 재생하는 어댑터
///
/// 스크립트가 끝나면 스트림은 영원히 대기합니다 (유휴 서버와 같음).
#[derive(Debug, Default)]
pub struct MockSource {
    segments: Vec<String>,
    fail_catalog: bool,
    fail_open: bool,
    stall_open: bool,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    probe: Probe,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segments(mut self, segments: &[&str]) -> Self {
        self.segments = segments.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_script(self, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().push_back(steps);
        self
    }

    pub fn failing_catalog(mut self) -> Self {
        self.fail_catalog = true;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// 연결이 끝나지 않는 서버 (도달 불가능한 호스트)
    pub fn stalling_open(mut self) -> Self {
        self.stall_open = true;
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }
}

#[async_trait]
impl SegmentCatalog for MockSource {
    async fn list_segments(&self, _profile: &ConnectionProfile) -> Result<Vec<String>> {
        self.probe.0.segment_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_catalog {
            return Err(CdcError::ConnectionError("admin connection refused".to_string()));
        }
        Ok(self.segments.clone())
    }
}

#[async_trait]
impl ReplicationSource for MockSource {
    type Stream = MockStream;

    async fn open(
        &self,
        _profile: &ConnectionProfile,
        _server_id: u32,
        position: &BinlogPosition,
    ) -> Result<MockStream> {
        if self.stall_open {
            std::future::pending::<()>().await;
        }
        if self.fail_open {
            return Err(CdcError::ConnectionError("replication connection refused".to_string()));
        }
        self.probe.0.opens.fetch_add(1, Ordering::SeqCst);
        self.probe.0.opened_at.lock().unwrap().push(position.clone());

        let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(MockStream {
            steps: steps.into(),
            probe: self.probe.clone(),
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct MockStream {
    steps: VecDeque<Step>,
    probe: Probe,
    closed: bool,
}

#[async_trait]
impl NotificationStream for MockStream {
    async fn next_notification(&mut self) -> Result<Option<RawNotification>> {
        loop {
            match self.steps.pop_front() {
                Some(Step::Deliver(n)) => return Ok(Some(n)),
                Some(Step::Stall(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Fail(msg)) => return Err(CdcError::IoError(msg)),
                Some(Step::End) => return Ok(None),
                None => return std::future::pending().await,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.probe.0.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
