use super::*;
use crate::types::{QueueItem, QueueItemId, Status};
use std::path::PathBuf;


fn item(id: u64, name: &str) -> QueueItem {
    QueueItem::new(
        QueueItemId(id),
        format!("http://example.com/{name}"),
        PathBuf::from(format!("/podcasts/{name}")),
    )
}
