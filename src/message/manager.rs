//! Read side of messages: lookups, paged listings, deletion and manual
//! requeue.

use crate::error::{SmithyError, SmithyResult};
use crate::events::{SharedEventBus, SmithyEvent};
use crate::message::{MessageEnvelope, MessageId, MessageStatus, fields};
use crate::queue::{QueueParams, QueueType, fields as queue_fields};
use crate::storage::{DELETE_BATCH_SIZE, MessageStorage};
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub use crate::storage::{DeleteMessagesReply, DeleteMessagesStats, DeleteStatus};

/// One page of a listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// 1-based page number
    pub page: u64,
    pub page_size: u64,
    /// Size of the whole listing
    pub total: u64,
    pub items: Vec<MessageEnvelope>,
}

impl MessagePage {
    /// Number of pages of the listing
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            0
        } else {
            self.total.div_ceil(self.page_size)
        }
    }
}

/// Inclusive index range of a 1-based page
fn page_bounds(page: u64, page_size: u64) -> (isize, isize) {
    let page = page.max(1);
    let size = page_size.max(1);
    let start = (page - 1) * size;
    (start as isize, (start + size - 1) as isize)
}

#[derive(Debug, Clone, Copy)]
enum Listing {
    List,
    RightToLeft,
    Oldest,
    Newest,
}

/// Message lookups and administrative operations
#[derive(Clone)]
pub struct MessageManager {
    storage: MessageStorage,
    events: SharedEventBus,
}

impl MessageManager {
    /// Create a message manager
    pub fn new(storage: MessageStorage, events: SharedEventBus) -> Self {
        Self { storage, events }
    }

    /// A message by id
    pub async fn get_message_by_id(&self, id: &MessageId) -> SmithyResult<MessageEnvelope> {
        let redis = self.storage.redis();
        let mut conn = redis.connection();
        let hash: HashMap<String, String> = conn.hgetall(redis.keys().message(id.as_str())).await?;
        MessageEnvelope::from_hash(&hash)?.ok_or_else(|| SmithyError::MessageNotFound {
            message_id: id.to_string(),
        })
    }

    /// Messages by id, in the given order; missing ids are skipped
    pub async fn get_messages_by_ids(
        &self,
        ids: &[MessageId],
    ) -> SmithyResult<Vec<MessageEnvelope>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let redis = self.storage.redis();
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(redis.keys().message(id.as_str()));
        }
        let mut conn = redis.connection();
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut messages = Vec::with_capacity(hashes.len());
        for hash in &hashes {
            if let Some(envelope) = MessageEnvelope::from_hash(hash)? {
                messages.push(envelope);
            }
        }
        Ok(messages)
    }

    /// Current status of a message
    pub async fn get_message_status(&self, id: &MessageId) -> SmithyResult<MessageStatus> {
        let redis = self.storage.redis();
        let mut conn = redis.connection();
        let status: Option<String> = conn
            .hget(redis.keys().message(id.as_str()), fields::STATUS)
            .await?;
        match status {
            Some(raw) => MessageStatus::parse_code(&raw),
            None => Err(SmithyError::MessageNotFound {
                message_id: id.to_string(),
            }),
        }
    }

    /// Pending messages in delivery order, per consumer group for PUB_SUB
    /// queues
    pub async fn get_pending_messages(
        &self,
        queue: &QueueParams,
        consumer_group: Option<&str>,
        page: u64,
        page_size: u64,
    ) -> SmithyResult<MessagePage> {
        let redis = self.storage.redis();
        let keys = redis.keys().queue(queue);
        let mut conn = redis.connection();
        let queue_type: Option<u8> = conn.hget(keys.properties(), queue_fields::QUEUE_TYPE).await?;
        let queue_type = queue_type.and_then(QueueType::from_code).ok_or_else(|| {
            SmithyError::QueueNotFound {
                queue: queue.to_string(),
            }
        })?;

        let (key, listing) = match queue_type {
            QueueType::Priority => (keys.priority_pending(consumer_group), Listing::Oldest),
            // both list types pop from the right end
            QueueType::Fifo | QueueType::Lifo => (keys.pending(consumer_group), Listing::RightToLeft),
        };
        self.page(key, listing, page, page_size).await
    }

    /// Scheduled messages, soonest first
    pub async fn get_scheduled_messages(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> SmithyResult<MessagePage> {
        let key = self.storage.redis().keys().queue(queue).scheduled();
        self.page(key, Listing::Oldest, page, page_size).await
    }

    /// Messages waiting for their retry delay
    pub async fn get_delayed_messages(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> SmithyResult<MessagePage> {
        let key = self.storage.redis().keys().queue(queue).delayed();
        self.page(key, Listing::List, page, page_size).await
    }

    /// Messages waiting to be requeued
    pub async fn get_requeued_messages(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> SmithyResult<MessagePage> {
        let key = self.storage.redis().keys().queue(queue).requeued();
        self.page(key, Listing::List, page, page_size).await
    }

    /// Acknowledged messages kept for audit, newest first
    pub async fn get_acknowledged_messages(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> SmithyResult<MessagePage> {
        let key = self.storage.redis().keys().queue(queue).acknowledged();
        self.page(key, Listing::Newest, page, page_size).await
    }

    /// Dead-lettered messages kept for audit, newest first
    pub async fn get_dead_lettered_messages(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> SmithyResult<MessagePage> {
        let key = self.storage.redis().keys().queue(queue).dead_lettered();
        self.page(key, Listing::Newest, page, page_size).await
    }

    async fn page(
        &self,
        key: String,
        listing: Listing,
        page: u64,
        page_size: u64,
    ) -> SmithyResult<MessagePage> {
        let (start, stop) = page_bounds(page, page_size);
        let mut conn = self.storage.redis().connection();
        let (total, ids): (u64, Vec<String>) = match listing {
            Listing::List => {
                let total: u64 = conn.llen(&key).await?;
                (total, conn.lrange(&key, start, stop).await?)
            }
            Listing::RightToLeft => {
                let total: u64 = conn.llen(&key).await?;
                let mut ids: Vec<String> = match reversed_bounds(total, start, stop) {
                    Some((from, to)) => conn.lrange(&key, from, to).await?,
                    None => Vec::new(),
                };
                ids.reverse();
                (total, ids)
            }
            Listing::Oldest => {
                let total: u64 = conn.zcard(&key).await?;
                (total, conn.zrange(&key, start, stop).await?)
            }
            Listing::Newest => {
                let total: u64 = conn.zcard(&key).await?;
                (total, conn.zrevrange(&key, start, stop).await?)
            }
        };

        let ids: Vec<MessageId> = ids.into_iter().map(MessageId::from).collect();
        Ok(MessagePage {
            page: page.max(1),
            page_size: page_size.max(1),
            total,
            items: self.get_messages_by_ids(&ids).await?,
        })
    }

    /// Delete one message
    pub async fn delete_message_by_id(&self, id: &MessageId) -> SmithyResult<DeleteMessagesReply> {
        self.delete_messages_by_ids(std::slice::from_ref(id)).await
    }

    /// Delete messages of any queues.
    ///
    /// Ids are grouped by queue and deleted in batches; missing ids and
    /// messages held by a consumer are counted, never fatal.
    pub async fn delete_messages_by_ids(
        &self,
        ids: &[MessageId],
    ) -> SmithyResult<DeleteMessagesReply> {
        let redis = self.storage.redis();
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hget(
                redis.keys().message(id.as_str()),
                &[fields::QUEUE, fields::CONSUMER_GROUP_ID],
            );
        }
        let mut conn = redis.connection();
        let locations: Vec<(Option<String>, Option<String>)> = if ids.is_empty() {
            Vec::new()
        } else {
            pipe.query_async(&mut conn).await?
        };

        let mut stats = DeleteMessagesStats::default();
        let mut by_queue: BTreeMap<String, Vec<(MessageId, Option<String>)>> = BTreeMap::new();
        for (id, (queue, group)) in ids.iter().zip(locations) {
            match queue {
                Some(queue) => by_queue
                    .entry(queue)
                    .or_default()
                    .push((id.clone(), group.filter(|g| !g.is_empty()))),
                None => stats.merge(DeleteMessagesStats::from_counts(0, 1, 0)),
            }
        }

        for (queue, messages) in by_queue {
            let queue: QueueParams = queue.parse()?;
            for batch in messages.chunks(DELETE_BATCH_SIZE) {
                let batch_stats = self.storage.delete_messages(&queue, batch).await?;
                tracing::debug!(queue = %queue, "deleted messages: {:?}", batch_stats);
                stats.merge(batch_stats);
            }
        }

        Ok(DeleteMessagesReply::from(stats))
    }

    /// Requeue an acknowledged or dead-lettered message of `queue` as a new
    /// message; returns the new id.
    pub async fn requeue_message_by_id(
        &self,
        queue: &QueueParams,
        id: &MessageId,
    ) -> SmithyResult<MessageId> {
        let original = self.get_message_by_id(id).await?;
        if original.queue() != queue {
            return Err(SmithyError::MessageQueueMismatch {
                message_id: id.to_string(),
                queue: queue.to_string(),
            });
        }
        if !original.status.is_requeuable() {
            return Err(SmithyError::MessageNotRequeuable {
                message_id: id.to_string(),
            });
        }

        let new_id = self.storage.requeue_message(&original).await?;
        tracing::info!(queue = %queue, message_id = %id, "🔨 Message requeued as {}", new_id);
        self.events.emit(SmithyEvent::MessageRequeued {
            queue: queue.clone(),
            message_id: new_id.clone(),
            original_id: id.clone(),
        });
        Ok(new_id)
    }
}

/// List indexes holding the `start..=stop` window counted from the right
fn reversed_bounds(len: u64, start: isize, stop: isize) -> Option<(isize, isize)> {
    let last = len as isize - 1;
    let to = last - start;
    if to < 0 {
        return None;
    }
    Some(((last - stop).max(0), to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        assert_eq!(page_bounds(1, 10), (0, 9));
        assert_eq!(page_bounds(3, 10), (20, 29));
        // page 0 is treated as the first page
        assert_eq!(page_bounds(0, 5), (0, 4));
    }

    #[test]
    fn test_reversed_bounds() {
        // 7 items, first page of 3 in pop order is the 3 rightmost
        assert_eq!(reversed_bounds(7, 0, 2), Some((4, 6)));
        assert_eq!(reversed_bounds(7, 6, 8), Some((0, 0)));
        assert_eq!(reversed_bounds(7, 9, 11), None);
        assert_eq!(reversed_bounds(0, 0, 9), None);
    }

    #[test]
    fn test_total_pages() {
        let page = MessagePage {
            page: 1,
            page_size: 3,
            total: 7,
            items: Vec::new(),
        };
        assert_eq!(page.total_pages(), 3);
    }
}
