//! Binlog 스트림 컨트롤러 - 연결, 재연결, 종료 및 이벤트 소비
//!
//! 상태 전이:
//! 1. `Unconnected` → `connect()` → `Connected`
//! 2. `Connected` → `close()` / 스트림 오류 / 종료 요청 → `Unconnected`
//!
//! 이벤트는 한 번에 하나씩 `next_event()`로 당겨옵니다. 호출은 어댑터가 다음
//! 알림을 전달할 때까지 대기합니다. 전달 보장은 at-least-once입니다: 재연결 시
//! `position()`을 사용하면 아직 전달되지 않은 이벤트를 잃지 않지만, 이미 전달된
//! 이벤트가 다시 올 수 있습니다.

use crate::classifier::classify;
use crate::config::ConnectionProfile;
use crate::error::{CdcError, Result};
use crate::events::ChangeEvent;
use crate::offset::BinlogPosition;
use crate::resolver::resolve_latest;
use crate::source::{NotificationStream, ReplicationSource};
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 컨트롤러 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Connected,
}

/// 스트림 옵션
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// 복제 클라이언트 server id (서버 및 다른 복제본과 달라야 함)
    pub server_id: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions { server_id: 1 }
    }
}

/// 다른 태스크에서 대기 중인 `next_event()`를 깨워 스트림을 닫게 하는 핸들
#[derive(Debug, Clone)]
pub struct StreamCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl StreamCloser {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closing(&self) -> bool {
        *self.tx.borrow()
    }
}

/// 열린 어댑터 연결과 아직 전달하지 않은 이벤트
struct StreamHandle<T> {
    stream: T,
    pending: VecDeque<ChangeEvent>,
    /// 대기 이벤트를 모두 전달한 뒤의 재시작 위치
    drained_position: Option<BinlogPosition>,
    notifications: u64,
    /// 어댑터 읽기가 끝나기 전에 future가 drop되면 남는 표시.
    /// 이 경우 패킷 경계나 테이블 맵 추적이 어긋났을 수 있음
    reading: bool,
}

impl<T> StreamHandle<T> {
    fn new(stream: T) -> Self {
        StreamHandle {
            stream,
            pending: VecDeque::new(),
            drained_position: None,
            notifications: 0,
            reading: false,
        }
    }
}

/// 변경 이벤트 스트림 컨트롤러
pub struct StreamController<S: ReplicationSource> {
    source: S,
    profile: ConnectionProfile,
    options: StreamOptions,
    handle: Option<StreamHandle<S::Stream>>,
    position: Option<BinlogPosition>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: ReplicationSource> StreamController<S> {
    pub fn new(source: S, profile: ConnectionProfile, options: StreamOptions) -> Self {
        let (tx, rx) = watch::channel(false);
        StreamController {
            source,
            profile,
            options,
            handle: None,
            position: None,
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    /// 스트림 열기
    ///
    /// 위치가 없으면 가장 최근 binlog 파일을 조회합니다. 이미 연결되어 있으면
    /// 기존 핸들을 먼저 닫습니다. 실제로 연 위치를 반환합니다.
    pub async fn connect(&mut self, position: Option<BinlogPosition>) -> Result<BinlogPosition> {
        if self.handle.is_some() {
            info!("Closing current binlog stream before reconnecting");
            if let Err(e) = self.close().await {
                warn!("Previous stream did not close cleanly: {}", e);
            }
        }

        // 이전 종료 요청 초기화
        self.shutdown_tx.send_replace(false);
        self.shutdown_rx.borrow_and_update();

        let position = match position {
            Some(position) => position,
            None => resolve_latest(&self.source, &self.profile)
                .await?
                .ok_or_else(|| {
                    CdcError::ConnectionError(
                        "No binary log segments on server; is binary logging enabled?"
                            .to_string(),
                    )
                })?,
        };

        info!(
            %position,
            server_id = self.options.server_id,
            host = %self.profile.host(),
            "Opening binlog stream"
        );

        let stream = self
            .source
            .open(&self.profile, self.options.server_id, &position)
            .await?;

        self.handle = Some(StreamHandle::new(stream));
        self.position = Some(position.clone());
        Ok(position)
    }

    /// 다음 변경 이벤트 하나를 당겨옴
    ///
    /// `Ok(None)`은 시퀀스 종료 (서버가 스트림을 닫았거나 종료 요청됨).
    /// 어댑터 오류는 `StreamRead`로 반환되며 컨트롤러는 `Unconnected`가 됩니다.
    pub async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            let handle = self.handle.as_mut().ok_or(CdcError::NotConnected)?;

            if let Some(event) = handle.pending.pop_front() {
                if handle.pending.is_empty() {
                    if let Some(drained) = handle.drained_position.take() {
                        self.position = Some(drained);
                    }
                }
                return Ok(Some(event));
            }

            if *self.shutdown_rx.borrow() {
                info!("Shutdown requested, closing binlog stream");
                self.close().await?;
                return Ok(None);
            }

            if handle.reading {
                warn!(
                    position = ?self.position,
                    "Previous read was cancelled mid-notification, dropping the stream"
                );
                if let Err(close_err) = self.close().await {
                    warn!("Failed to release interrupted stream: {}", close_err);
                }
                return Err(CdcError::StreamRead(
                    "previous read was cancelled before it completed; reconnect at position()"
                        .to_string(),
                ));
            }

            handle.reading = true;
            let read = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => None,
                read = handle.stream.next_notification() => Some(read),
            };
            if read.is_some() {
                handle.reading = false;
            }

            match read {
                // 종료 요청 여부는 루프 처음에서 확인
                None => continue,
                Some(Ok(Some(notification))) => {
                    let handle = self.handle.as_mut().ok_or(CdcError::NotConnected)?;
                    handle.notifications += 1;

                    let events = classify(&notification);
                    debug!(
                        event_type = ?notification.event_type(),
                        events = events.len(),
                        checkpoint = %notification.checkpoint,
                        "Received notification #{}",
                        handle.notifications
                    );

                    if events.is_empty() {
                        self.position = Some(notification.resume_after);
                    } else {
                        self.position = Some(notification.checkpoint);
                        handle.drained_position = Some(notification.resume_after);
                        handle.pending.extend(events);
                    }
                }
                Some(Ok(None)) => {
                    info!("Server closed the binlog stream");
                    self.close().await?;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    let e = e.into_stream_read();
                    error!(position = ?self.position, "Binlog stream failed: {}", e);
                    if let Err(close_err) = self.close().await {
                        warn!("Failed to release broken stream: {}", close_err);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// 지연 평가되는 이벤트 시퀀스
    ///
    /// `next_event()`가 `Ok(None)`을 반환하거나 첫 오류를 낸 뒤 끝납니다.
    pub fn events(&mut self) -> impl Stream<Item = Result<ChangeEvent>> + '_ {
        futures::stream::unfold((self, false), |(controller, failed)| async move {
            if failed {
                return None;
            }
            match controller.next_event().await {
                Ok(Some(event)) => Some((Ok(event), (controller, false))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (controller, true))),
            }
        })
    }

    /// 어댑터 핸들 해제 (여러 번 호출해도 안전)
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            debug!("close() called without an open stream");
            return Ok(());
        };

        if !handle.pending.is_empty() {
            debug!(
                discarded = handle.pending.len(),
                "Discarding undelivered events; they will be replayed from the checkpoint"
            );
        }

        let result = handle.stream.close().await;
        info!(
            position = ?self.position,
            notifications = handle.notifications,
            "Binlog stream closed"
        );
        result
    }

    /// 읽기 도중 취소된 핸들은 더 이상 쓸 수 없으므로 `Unconnected`
    pub fn state(&self) -> StreamState {
        match &self.handle {
            Some(handle) if !handle.reading => StreamState::Connected,
            _ => StreamState::Unconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Connected
    }

    /// 재연결 시 사용할 위치 (연결한 적이 없으면 `None`)
    pub fn position(&self) -> Option<&BinlogPosition> {
        self.position.as_ref()
    }

    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CellValue, EventType};
    use crate::testing::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    fn start() -> Option<BinlogPosition> {
        Some(BinlogPosition::start_of(TEST_FILE))
    }

    fn john() -> crate::events::Row {
        row(&[
            ("id", CellValue::Int(4)),
            ("name", "John".into()),
            ("email", "john@example.com".into()),
        ])
    }

    fn controller(source: MockSource) -> StreamController<MockSource> {
        StreamController::new(source, profile(), StreamOptions::default())
    }

    #[tokio::test]
    async fn test_insert_update_delete_scenario() {
        let mai = row(&[
            ("id", CellValue::Int(3)),
            ("name", "Mai".into()),
            ("email", "mai@example.com".into()),
        ]);
        let mei = row(&[
            ("id", CellValue::Int(3)),
            ("name", "Mei".into()),
            ("email", "mei@example.com".into()),
        ]);
        let source = MockSource::new().with_script(vec![
            Step::Deliver(write_rows("d.users", vec![john()])),
            Step::Deliver(update_rows("d.users", vec![(mai.clone(), mei.clone())])),
            Step::Deliver(delete_rows("d.users", vec![john()])),
        ]);
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        assert_eq!(
            ctrl.next_event().await.unwrap(),
            Some(ChangeEvent::Insert {
                table: "d.users".to_string(),
                row: john()
            })
        );
        assert_eq!(
            ctrl.next_event().await.unwrap(),
            Some(ChangeEvent::Update {
                table: "d.users".to_string(),
                before: mai,
                after: mei
            })
        );
        assert_eq!(
            ctrl.next_event().await.unwrap(),
            Some(ChangeEvent::Delete {
                table: "d.users".to_string(),
                row: john()
            })
        );
    }

    #[tokio::test]
    async fn test_non_row_notifications_do_not_stall() {
        let source = MockSource::new().with_script(vec![
            Step::Deliver(other(EventType::HeartbeatEvent)),
            Step::Deliver(other(EventType::RotateEvent)),
            Step::Deliver(write_rows("d.users", vec![john()])),
        ]);
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        let event = ctrl.next_event().await.unwrap().unwrap();
        assert_eq!(event.table(), "d.users");
    }

    #[tokio::test]
    async fn test_connect_without_position_resolves_latest() {
        let source = MockSource::new().with_segments(&["mysql-bin.000001", "mysql-bin.000002"]);
        let probe = source.probe();
        let mut ctrl = controller(source);

        let opened = ctrl.connect(None).await.unwrap();
        assert_eq!(opened, BinlogPosition::start_of("mysql-bin.000002"));
        assert_eq!(probe.opened_at(), vec![opened.clone()]);
        assert_eq!(ctrl.position(), Some(&opened));
        assert_eq!(ctrl.state(), StreamState::Connected);
    }

    #[tokio::test]
    async fn test_connect_with_position_skips_resolver() {
        let source = MockSource::new().with_segments(&["mysql-bin.000009"]);
        let probe = source.probe();
        let mut ctrl = controller(source);

        let explicit = BinlogPosition::new("mysql-bin.000003", 1200);
        ctrl.connect(Some(explicit.clone())).await.unwrap();
        assert_eq!(probe.segment_lookups(), 0);
        assert_eq!(probe.opened_at(), vec![explicit]);
    }

    #[tokio::test]
    async fn test_connect_without_segments_fails() {
        let source = MockSource::new();
        let probe = source.probe();
        let mut ctrl = controller(source);

        let result = ctrl.connect(None).await;
        assert!(matches!(result, Err(CdcError::ConnectionError(_))));
        assert_eq!(probe.opens(), 0);
        assert_eq!(ctrl.state(), StreamState::Unconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_unconnected() {
        let mut ctrl = controller(MockSource::new().failing_open());
        let result = ctrl.connect(start()).await;
        assert!(matches!(result, Err(CdcError::ConnectionError(_))));
        assert!(!ctrl.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_handle() {
        let source = MockSource::new();
        let probe = source.probe();
        let mut ctrl = controller(source);

        ctrl.connect(start()).await.unwrap();
        ctrl.connect(Some(BinlogPosition::new(TEST_FILE, 500)))
            .await
            .unwrap();

        assert_eq!(probe.opens(), 2);
        assert_eq!(probe.closes(), 1);
        assert_eq!(ctrl.state(), StreamState::Connected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let source = MockSource::new();
        let probe = source.probe();
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        ctrl.close().await.unwrap();
        assert_eq!(ctrl.state(), StreamState::Unconnected);
        ctrl.close().await.unwrap();
        assert_eq!(ctrl.state(), StreamState::Unconnected);
        assert_eq!(probe.closes(), 1);
    }

    #[tokio::test]
    async fn test_next_event_requires_connection() {
        let mut ctrl = controller(MockSource::new());
        assert!(matches!(ctrl.next_event().await, Err(CdcError::NotConnected)));

        ctrl.connect(start()).await.unwrap();
        ctrl.close().await.unwrap();
        assert!(matches!(ctrl.next_event().await, Err(CdcError::NotConnected)));
    }

    #[tokio::test]
    async fn test_stream_fault_disconnects_and_keeps_position() {
        let source = MockSource::new()
            .with_script(vec![
                Step::Deliver(positioned(write_rows("d.users", vec![john()]), 120, 400)),
                Step::Fail("connection reset by peer".to_string()),
            ])
            .with_script(vec![Step::Deliver(write_rows("d.users", vec![john()]))]);
        let probe = source.probe();
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        assert!(ctrl.next_event().await.unwrap().is_some());
        let err = ctrl.next_event().await.unwrap_err();
        assert!(matches!(err, CdcError::StreamRead(_)));
        assert_eq!(ctrl.state(), StreamState::Unconnected);
        assert_eq!(probe.closes(), 1);

        let resume = ctrl.position().cloned().unwrap();
        assert_eq!(resume, BinlogPosition::new(TEST_FILE, 400));
        assert!(matches!(ctrl.next_event().await, Err(CdcError::NotConnected)));

        ctrl.connect(Some(resume.clone())).await.unwrap();
        assert_eq!(probe.opened_at().last(), Some(&resume));
        assert!(ctrl.next_event().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_server_end_of_stream_ends_sequence() {
        let source = MockSource::new().with_script(vec![
            Step::Deliver(write_rows("d.users", vec![john()])),
            Step::End,
        ]);
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        assert!(ctrl.next_event().await.unwrap().is_some());
        assert_eq!(ctrl.next_event().await.unwrap(), None);
        assert_eq!(ctrl.state(), StreamState::Unconnected);
    }

    #[tokio::test]
    async fn test_position_tracks_multi_row_notifications() {
        let two_rows = vec![
            row(&[("id", CellValue::Int(1))]),
            row(&[("id", CellValue::Int(2))]),
        ];
        let source = MockSource::new().with_script(vec![
            Step::Deliver(positioned(write_rows("d.t", two_rows), 100, 300)),
            Step::Deliver(positioned(other(EventType::XidEvent), 300, 350)),
            Step::Deliver(positioned(
                delete_rows("d.t", vec![row(&[("id", CellValue::Int(1))])]),
                350,
                500,
            )),
        ]);
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        ctrl.next_event().await.unwrap();
        // 두 번째 행이 아직 전달되지 않음 → 알림 전체를 다시 받아야 함
        assert_eq!(ctrl.position(), Some(&BinlogPosition::new(TEST_FILE, 100)));

        ctrl.next_event().await.unwrap();
        assert_eq!(ctrl.position(), Some(&BinlogPosition::new(TEST_FILE, 300)));

        ctrl.next_event().await.unwrap();
        assert_eq!(ctrl.position(), Some(&BinlogPosition::new(TEST_FILE, 500)));
    }

    #[tokio::test]
    async fn test_closer_interrupts_pending_read() {
        let mut ctrl = controller(MockSource::new());
        ctrl.connect(start()).await.unwrap();
        let closer = ctrl.closer();

        {
            let mut pull = tokio_test::task::spawn(ctrl.next_event());
            assert_pending!(pull.poll());

            closer.close();
            assert!(pull.is_woken());
            let result = assert_ready!(pull.poll());
            assert!(matches!(result, Ok(None)));
        }

        assert_eq!(ctrl.state(), StreamState::Unconnected);
        assert!(closer.is_closing());
    }

    #[tokio::test]
    async fn test_reconnect_clears_shutdown_request() {
        let source = MockSource::new()
            .with_script(vec![])
            .with_script(vec![Step::Deliver(write_rows("d.users", vec![john()]))]);
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        ctrl.closer().close();
        assert_eq!(ctrl.next_event().await.unwrap(), None);

        ctrl.connect(start()).await.unwrap();
        assert!(!ctrl.closer().is_closing());
        assert!(ctrl.next_event().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_events_stream_ends_with_server() {
        let source = MockSource::new().with_script(vec![
            Step::Deliver(write_rows(
                "d.users",
                vec![row(&[("id", CellValue::Int(1))]), row(&[("id", CellValue::Int(2))])],
            )),
            Step::Deliver(other(EventType::HeartbeatEvent)),
            Step::Deliver(delete_rows("d.users", vec![row(&[("id", CellValue::Int(1))])])),
            Step::End,
        ]);
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        let events: Vec<ChangeEvent> = ctrl
            .events()
            .map(|e| e.unwrap())
            .collect()
            .await;
        let ops: Vec<&str> = events.iter().map(|e| e.op().as_str()).collect();
        assert_eq!(ops, vec!["INSERT", "INSERT", "DELETE"]);
    }

    #[tokio::test]
    async fn test_events_stream_stops_after_error() {
        let source = MockSource::new().with_script(vec![Step::Fail("boom".to_string())]);
        let mut ctrl = controller(source);
        ctrl.connect(start()).await.unwrap();

        let items: Vec<Result<ChangeEvent>> = ctrl.events().collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(CdcError::StreamRead(_))));
    }

    #[tokio::test]
    async fn test_cancelled_read_drops_stream() {
        let source = MockSource::new().with_script(vec![
            Step::Deliver(positioned(other(EventType::TableMapEvent), 100, 100)),
            // 패킷 일부만 도착한 상태
            Step::Stall(Duration::from_millis(500)),
            Step::Deliver(positioned(write_rows("d.users", vec![john()]), 100, 300)),
        ]);
        let probe = source.probe();
        let mut controller = controller(source);
        controller.connect(start()).await.unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), controller.next_event()).await;
        assert!(timed_out.is_err());
        assert_eq!(controller.state(), StreamState::Unconnected);
        assert!(!controller.is_connected());

        let result = controller.next_event().await;
        assert!(matches!(result, Err(CdcError::StreamRead(_))));
        assert_eq!(probe.closes(), 1);
        assert_eq!(
            controller.position(),
            Some(&BinlogPosition::new(TEST_FILE, 100))
        );
        assert!(matches!(
            controller.next_event().await,
            Err(CdcError::NotConnected)
        ));
    }
}
