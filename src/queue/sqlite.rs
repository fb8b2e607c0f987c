//! Durable queue backed by SQLite. Several named queues share one store.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{QueueError, QueueMessage, ReceiptHandle, ReceivedMessage, WorkQueue};
use crate::db::{format_timestamp, now, open_database, open_memory_database};

/// Shared connection to the queue tables.
#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl QueueStore {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        Ok(Self::from_connection(open_database(path)?))
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Ok(Self::from_connection(open_memory_database()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn queue(&self, name: &str) -> SqliteWorkQueue {
        SqliteWorkQueue {
            store: self.clone(),
            name: name.to_string(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::LockPoisoned)
    }
}

pub struct SqliteWorkQueue {
    store: QueueStore,
    name: String,
}

fn offset(at: NaiveDateTime, delay: Duration) -> NaiveDateTime {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(NaiveDateTime::MAX)
}

impl SqliteWorkQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages in this queue, visible or not.
    pub fn len(&self) -> Result<usize, QueueError> {
        let conn = self.store.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Decoded bodies of every message in the queue, oldest first. For
    /// inspection; does not affect visibility.
    pub fn peek_all(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let conn = self.store.lock()?;
        let mut stmt =
            conn.prepare("SELECT body FROM queue_messages WHERE queue_name = ?1 ORDER BY id")?;
        let bodies = stmt.query_map(params![self.name], |row| row.get::<_, String>(0))?;

        let mut messages = Vec::new();
        for body in bodies {
            let body = body?;
            messages.push(
                serde_json::from_str(&body).map_err(|e| QueueError::Malformed(e.to_string()))?,
            );
        }
        Ok(messages)
    }

    /// Make every message visible now. Lets tests skip backoff delays.
    pub fn expedite_all(&self) -> Result<(), QueueError> {
        let conn = self.store.lock()?;
        conn.execute(
            "UPDATE queue_messages SET visible_at = ?2, receipt_handle = NULL WHERE queue_name = ?1",
            params![self.name, format_timestamp(&now())],
        )?;
        Ok(())
    }
}

impl WorkQueue for SqliteWorkQueue {
    fn send(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let body = serde_json::to_string(message)?;
        let sent_at = now();
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT INTO queue_messages (queue_name, body, visible_at, sent_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                self.name,
                body,
                format_timestamp(&offset(sent_at, delay)),
                format_timestamp(&sent_at),
            ],
        )?;
        Ok(())
    }

    fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<ReceivedMessage>, QueueError> {
        let at = now();
        let hidden_until = format_timestamp(&offset(at, visibility));
        let conn = self.store.lock()?;
        let tx = conn.unchecked_transaction()?;

        let candidates: Vec<(i64, String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, body, receive_count FROM queue_messages
                 WHERE queue_name = ?1 AND visible_at <= ?2
                 ORDER BY visible_at, id LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![self.name, format_timestamp(&at), max as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            rows.collect::<Result<_, _>>()?
        };

        let mut received = Vec::with_capacity(candidates.len());
        for (id, body, count) in candidates {
            let receipt = Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE queue_messages
                 SET receipt_handle = ?2, visible_at = ?3, receive_count = receive_count + 1
                 WHERE id = ?1",
                params![id, receipt, hidden_until],
            )?;
            received.push(ReceivedMessage {
                receipt: ReceiptHandle(receipt),
                body,
                receive_count: count + 1,
            });
        }

        tx.commit()?;
        Ok(received)
    }

    fn delete(&self, receipt: &ReceiptHandle) -> Result<bool, QueueError> {
        let conn = self.store.lock()?;
        let deleted = conn.execute(
            "DELETE FROM queue_messages WHERE queue_name = ?1 AND receipt_handle = ?2",
            params![self.name, receipt.0],
        )?;
        Ok(deleted > 0)
    }

    fn release(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<bool, QueueError> {
        let visible_at = format_timestamp(&offset(now(), delay));
        let conn = self.store.lock()?;
        let updated = conn.execute(
            "UPDATE queue_messages SET visible_at = ?3, receipt_handle = NULL
             WHERE queue_name = ?1 AND receipt_handle = ?2",
            params![self.name, receipt.0, visible_at],
        )?;
        Ok(updated > 0)
    }
}
