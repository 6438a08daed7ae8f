//! 스트림을 sink로 흘려보내는 실행 루프

use crate::controller::StreamController;
use crate::error::Result;
use crate::offset::BinlogPosition;
use crate::sink::EventSink;
use crate::source::ReplicationSource;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::info;

/// 연결 후 시퀀스가 끝날 때까지 이벤트를 sink로 전달
///
/// `interrupt`가 `true`가 되면 연결 중이든 대기 중이든 멈추고 `Ok(())`를 반환합니다.
pub async fn run_to_sink<S, K>(
    controller: &mut StreamController<S>,
    sink: &mut K,
    start: Option<BinlogPosition>,
    mut interrupt: watch::Receiver<bool>,
) -> Result<()>
where
    S: ReplicationSource,
    K: EventSink,
{
    let position = tokio::select! {
        biased;
        Ok(_) = interrupt.wait_for(|stop| *stop) => {
            info!("Interrupted before the binlog stream opened");
            return Ok(());
        }
        position = controller.connect(start) => position?,
    };

    // connect()가 종료 요청을 초기화하므로 인터럽트를 컨트롤러에 다시 전달
    let closer = controller.closer();
    if *interrupt.borrow() {
        closer.close();
    }
    tokio::spawn(async move {
        if interrupt.wait_for(|stop| *stop).await.is_ok() {
            closer.close();
        }
    });

    info!(%position, "Listening for change events...");

    let events = controller.events();
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        sink.emit(&event?)?;
        sink.flush()?;
    }
    Ok(())
}
