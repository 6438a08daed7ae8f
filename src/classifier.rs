//! 원시 알림 → 도메인 이벤트 분류
//!
//! 행 변경 알림 하나는 영향받은 행마다 이벤트 하나를 만듭니다.
//! 그 외 알림(DDL, 하트비트, 로테이션 등)은 이벤트를 만들지 않습니다.
//! 출력 순서는 알림 순서, 그리고 알림 안의 행 순서를 그대로 따릅니다.

use crate::events::{
    CellValue, ChangeEvent, NotificationBody, RawNotification, Row, RowChange,
};
use tracing::trace;

/// 알림 하나를 0개 이상의 도메인 이벤트로 변환
pub fn classify(notification: &RawNotification) -> Vec<ChangeEvent> {
    classify_body(&notification.body)
}

pub fn classify_body(body: &NotificationBody) -> Vec<ChangeEvent> {
    match body {
        NotificationBody::WriteRows(data) => data
            .rows
            .iter()
            .map(|row| ChangeEvent::Insert {
                table: data.table.clone(),
                row: row.clone(),
            })
            .collect(),
        NotificationBody::UpdateRows(data) => data
            .rows
            .iter()
            .map(|change| {
                let (before, after) = align_images(change);
                ChangeEvent::Update {
                    table: data.table.clone(),
                    before,
                    after,
                }
            })
            .collect(),
        NotificationBody::DeleteRows(data) => data
            .rows
            .iter()
            .map(|row| ChangeEvent::Delete {
                table: data.table.clone(),
                row: row.clone(),
            })
            .collect(),
        NotificationBody::Other(event_type) => {
            trace!(?event_type, "Ignoring non-row notification");
            Vec::new()
        }
    }
}

/// before/after 이미지의 키 집합을 맞춤
///
/// 한쪽에만 있는 컬럼은 다른 쪽에 NULL로 추가됩니다 (MINIMAL row image).
fn align_images(change: &RowChange) -> (Row, Row) {
    let mut before = change.before.clone();
    let mut after = change.after.clone();

    if before.len() == after.len() && before.keys().all(|k| after.contains_key(k)) {
        return (before, after);
    }

    for key in change.before.keys() {
        if !after.contains_key(key) {
            after.insert(key.clone(), CellValue::Null);
        }
    }
    for key in change.after.keys() {
        if !before.contains_key(key) {
            before.insert(key.clone(), CellValue::Null);
        }
    }

    // 양쪽 모두 같은 컬럼 순서로 정렬
    let order: Vec<String> = before.keys().cloned().collect();
    let mut ordered_after = Row::with_capacity(order.len());
    for key in &order {
        if let Some(value) = after.swap_remove(key) {
            ordered_after.insert(key.clone(), value);
        }
    }

    (before, ordered_after)
}
