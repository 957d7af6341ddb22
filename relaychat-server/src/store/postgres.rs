use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{
    Chat, ChatSummary, MarkReadOutcome, Message, ReadReceipt, Timestamp, UnreadCounter,
};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{
    ChatStore, MessagePosted, MessageRemoved, NewChat, NewMessage, ParticipantsAdded, ReadMarked,
    StoreError, StoreResult, chat_not_found, ensure_can_post, ensure_capacity, ensure_sender,
    message_not_found,
};

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: Uuid,
    name: String,
    active: bool,
    created_at: DateTime<Utc>,
}

impl ChatRow {
    fn into_chat(self, participants: BTreeSet<Uuid>) -> Chat {
        Chat {
            id: self.id,
            name: self.name,
            participants,
            active: self.active,
            created_at: Timestamp(self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    chat_id: Uuid,
    sender_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
    edited: bool,
    edited_at: Option<DateTime<Utc>>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: Timestamp(row.created_at),
            edited: row.edited,
            edited_at: row.edited_at.map(Timestamp),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReceiptRow {
    message_id: Uuid,
    chat_id: Uuid,
    user_id: Uuid,
    read_at: DateTime<Utc>,
}

impl From<ReceiptRow> for ReadReceipt {
    fn from(row: ReceiptRow) -> Self {
        Self {
            message_id: row.message_id,
            chat_id: row.chat_id,
            user_id: row.user_id,
            read_at: Timestamp(row.read_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    chat_id: Uuid,
    user_id: Uuid,
    count: i64,
}

impl From<CounterRow> for UnreadCounter {
    fn from(row: CounterRow) -> Self {
        Self {
            chat_id: row.chat_id,
            user_id: row.user_id,
            count: row.count,
        }
    }
}

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, content, created_at, edited, edited_at";

/// Row locks taken on a chat before reading its participant set.
#[derive(Clone, Copy)]
enum ChatLock {
    None,
    Share,
    Update,
}

impl ChatLock {
    const fn clause(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Share => " FOR SHARE",
            Self::Update => " FOR UPDATE",
        }
    }
}

/// Postgres-backed store. Each mutating method runs in its own transaction;
/// unread counters are changed with single-statement upserts so concurrent
/// writers on different processes never lose an increment.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl fmt::Debug for PgChatStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgChatStore").finish()
    }
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_chat(
        conn: &mut PgConnection,
        chat_id: Uuid,
        lock: ChatLock,
    ) -> StoreResult<Chat> {
        let sql = format!(
            "SELECT id, name, active, created_at FROM chats WHERE id = $1{}",
            lock.clause()
        );
        let row = sqlx::query_as::<_, ChatRow>(&sql)
            .bind(chat_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| chat_not_found(chat_id))?;

        let participants: Vec<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM chat_participants WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_all(&mut *conn)
                .await?;

        Ok(row.into_chat(participants.into_iter().collect()))
    }

    async fn load_message(
        conn: &mut PgConnection,
        message_id: Uuid,
        for_update: bool,
    ) -> StoreResult<Message> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1{}",
            if for_update { " FOR UPDATE" } else { "" }
        );
        sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await?
            .map(Message::from)
            .ok_or_else(|| message_not_found(message_id))
    }

    async fn read_by_count(conn: &mut PgConnection, message: &Message) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM read_receipts r
            JOIN chat_participants p ON p.chat_id = r.chat_id AND p.user_id = r.user_id
            WHERE r.message_id = $1 AND r.user_id <> $2
            "#,
        )
        .bind(message.id)
        .bind(message.sender_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_chat(&self, chat: NewChat) -> StoreResult<Chat> {
        if chat.participants.is_empty() {
            return Err(StoreError::Validation(
                "a chat needs at least one participant".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ChatRow>(
            r#"
            INSERT INTO chats (id, name, active, created_at)
            VALUES ($1, $2, TRUE, $3)
            RETURNING id, name, active, created_at
            "#,
        )
        .bind(chat.id)
        .bind(&chat.name)
        .bind(chat.created_at.0)
        .fetch_one(&mut *tx)
        .await?;

        let participants: BTreeSet<Uuid> = chat.participants.into_iter().collect();
        let ids: Vec<Uuid> = participants.iter().copied().collect();
        sqlx::query(
            r#"
            INSERT INTO chat_participants (chat_id, user_id, joined_at)
            SELECT $1, user_id, $2 FROM UNNEST($3::uuid[]) AS user_id
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.created_at)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into_chat(participants))
    }

    async fn add_participants(
        &self,
        chat_id: Uuid,
        user_ids: &[Uuid],
        max_participants: usize,
    ) -> StoreResult<ParticipantsAdded> {
        let mut tx = self.pool.begin().await?;
        // FOR UPDATE serializes membership changes against in-flight sends,
        // which hold FOR SHARE while incrementing counters.
        let current = Self::load_chat(&mut tx, chat_id, ChatLock::Update).await?;

        let requested: Vec<Uuid> = user_ids
            .iter()
            .copied()
            .filter(|user_id| !current.is_participant(*user_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        ensure_capacity(&current, requested.len(), max_participants)?;
        let mut added: Vec<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO chat_participants (chat_id, user_id, joined_at)
            SELECT $1, user_id, NOW() FROM UNNEST($2::uuid[]) AS user_id
            ON CONFLICT DO NOTHING
            RETURNING user_id
            "#,
        )
        .bind(chat_id)
        .bind(&requested)
        .fetch_all(&mut *tx)
        .await?;
        added.sort();

        let chat = Self::load_chat(&mut tx, chat_id, ChatLock::None).await?;
        tx.commit().await?;
        Ok(ParticipantsAdded { chat, added })
    }

    async fn insert_message(&self, message: NewMessage) -> StoreResult<MessagePosted> {
        let mut tx = self.pool.begin().await?;
        let chat = Self::load_chat(&mut tx, message.chat_id, ChatLock::Share).await?;
        ensure_can_post(&chat, message.sender_id)?;

        let sql = format!(
            r#"
            INSERT INTO messages (id, chat_id, sender_id, content, created_at, edited)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            RETURNING {MESSAGE_COLUMNS}
            "#
        );
        let stored: Message = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message.id)
            .bind(message.chat_id)
            .bind(message.sender_id)
            .bind(&message.content)
            .bind(message.created_at.0)
            .fetch_one(&mut *tx)
            .await?
            .into();

        // Participants iterate in a fixed order so concurrent sends lock
        // counter rows in the same sequence.
        let mut counters = Vec::with_capacity(chat.participant_count());
        for recipient in chat.recipients_of(stored.sender_id) {
            let row = sqlx::query_as::<_, CounterRow>(
                r#"
                INSERT INTO unread_counters (chat_id, user_id, count, updated_at)
                VALUES ($1, $2, 1, NOW())
                ON CONFLICT (chat_id, user_id)
                DO UPDATE SET count = unread_counters.count + 1, updated_at = NOW()
                RETURNING chat_id, user_id, count
                "#,
            )
            .bind(chat.id)
            .bind(recipient)
            .fetch_one(&mut *tx)
            .await?;
            counters.push(UnreadCounter::from(row));
        }

        tx.commit().await?;
        Ok(MessagePosted {
            message: stored,
            chat,
            counters,
        })
    }

    async fn update_message(
        &self,
        message_id: Uuid,
        editor_id: Uuid,
        content: &str,
        edited_at: Timestamp,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let existing = Self::load_message(&mut tx, message_id, true).await?;
        ensure_sender(&existing, editor_id)?;

        let sql = format!(
            r#"
            UPDATE messages
            SET content = $2, edited = TRUE, edited_at = $3
            WHERE id = $1
            RETURNING {MESSAGE_COLUMNS}
            "#
        );
        let updated: Message = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message_id)
            .bind(content)
            .bind(edited_at.0)
            .fetch_one(&mut *tx)
            .await?
            .into();

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_message(
        &self,
        message_id: Uuid,
        requester_id: Uuid,
    ) -> StoreResult<MessageRemoved> {
        let mut tx = self.pool.begin().await?;
        let message = Self::load_message(&mut tx, message_id, true).await?;
        ensure_sender(&message, requester_id)?;

        sqlx::query("DELETE FROM read_receipts WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        let chat = Self::load_chat(&mut tx, message.chat_id, ChatLock::None).await?;

        tx.commit().await?;
        Ok(MessageRemoved { message, chat })
    }

    async fn mark_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        read_at: Timestamp,
    ) -> StoreResult<ReadMarked> {
        let mut tx = self.pool.begin().await?;
        // Receipt writers on one message run one at a time, so each sees every
        // earlier receipt when counting, and a concurrent delete either wins
        // (NotFound here) or waits for this receipt to commit.
        let message = Self::load_message(&mut tx, message_id, true).await?;
        let chat = Self::load_chat(&mut tx, message.chat_id, ChatLock::Share).await?;
        if !chat.is_participant(user_id) {
            return Err(StoreError::Forbidden(format!(
                "user {user_id} is not a participant of chat {}",
                chat.id
            )));
        }

        if message.sender_id == user_id {
            let read_by_count = Self::read_by_count(&mut tx, &message).await?;
            tx.commit().await?;
            return Ok(ReadMarked {
                outcome: MarkReadOutcome {
                    receipt: None,
                    created: false,
                    reset_counter: None,
                },
                message,
                chat,
                read_by_count,
            });
        }

        let inserted = sqlx::query_as::<_, ReceiptRow>(
            r#"
            INSERT INTO read_receipts (message_id, user_id, chat_id, read_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (message_id, user_id) DO NOTHING
            RETURNING message_id, chat_id, user_id, read_at
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .bind(chat.id)
        .bind(read_at.0)
        .fetch_optional(&mut *tx)
        .await?;

        let created = inserted.is_some();
        let receipt: ReadReceipt = match inserted {
            Some(row) => row.into(),
            None => sqlx::query_as::<_, ReceiptRow>(
                r#"
                SELECT message_id, chat_id, user_id, read_at
                FROM read_receipts
                WHERE message_id = $1 AND user_id = $2
                "#,
            )
            .bind(message_id)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?
            .into(),
        };

        let reset_counter = if created {
            sqlx::query_as::<_, CounterRow>(
                r#"
                UPDATE unread_counters
                SET count = 0, updated_at = NOW()
                WHERE chat_id = $1 AND user_id = $2 AND count > 0
                RETURNING chat_id, user_id, count
                "#,
            )
            .bind(chat.id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(UnreadCounter::from)
        } else {
            None
        };

        let read_by_count = Self::read_by_count(&mut tx, &message).await?;
        tx.commit().await?;

        Ok(ReadMarked {
            outcome: MarkReadOutcome {
                receipt: Some(receipt),
                created,
                reset_counter,
            },
            message,
            chat,
            read_by_count,
        })
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        let mut conn = self.pool.acquire().await?;
        Self::load_chat(&mut conn, chat_id, ChatLock::None).await
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let mut conn = self.pool.acquire().await?;
        Self::load_message(&mut conn, message_id, false).await
    }

    async fn list_messages(&self, chat_id: Uuid) -> StoreResult<Vec<Message>> {
        let mut conn = self.pool.acquire().await?;
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM chats WHERE id = $1)")
            .bind(chat_id)
            .fetch_one(&mut *conn)
            .await?;
        if !exists {
            return Err(chat_not_found(chat_id));
        }

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(chat_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn list_chats_for_user(&self, user_id: Uuid) -> StoreResult<Vec<ChatSummary>> {
        #[derive(sqlx::FromRow)]
        struct SummaryRow {
            id: Uuid,
            name: String,
            active: bool,
            created_at: DateTime<Utc>,
            unread_count: i64,
            last_message_at: Option<DateTime<Utc>>,
        }

        #[derive(sqlx::FromRow)]
        struct MemberRow {
            chat_id: Uuid,
            user_id: Uuid,
        }

        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT c.id, c.name, c.active, c.created_at,
                   COALESCE(u.count, 0) AS unread_count,
                   (SELECT MAX(m.created_at) FROM messages m WHERE m.chat_id = c.id)
                       AS last_message_at
            FROM chats c
            JOIN chat_participants p ON p.chat_id = c.id AND p.user_id = $1
            LEFT JOIN unread_counters u ON u.chat_id = c.id AND u.user_id = $1
            ORDER BY last_message_at DESC NULLS LAST, c.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

        let chat_ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let members = sqlx::query_as::<_, MemberRow>(
            "SELECT chat_id, user_id FROM chat_participants WHERE chat_id = ANY($1)",
        )
        .bind(&chat_ids)
        .fetch_all(&mut *conn)
        .await?;

        let mut participants: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
        for member in members {
            participants
                .entry(member.chat_id)
                .or_default()
                .insert(member.user_id);
        }

        Ok(rows
            .into_iter()
            .map(|row| ChatSummary {
                chat: Chat {
                    id: row.id,
                    name: row.name,
                    participants: participants.remove(&row.id).unwrap_or_default(),
                    active: row.active,
                    created_at: Timestamp(row.created_at),
                },
                unread_count: row.unread_count,
                last_message_at: row.last_message_at.map(Timestamp),
            })
            .collect())
    }

    async fn list_receipts(&self, message_id: Uuid) -> StoreResult<Vec<ReadReceipt>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_message(&mut conn, message_id, false).await?;

        let rows = sqlx::query_as::<_, ReceiptRow>(
            r#"
            SELECT message_id, chat_id, user_id, read_at
            FROM read_receipts
            WHERE message_id = $1
            ORDER BY read_at, user_id
            "#,
        )
        .bind(message_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(ReadReceipt::from).collect())
    }

    async fn unread_counters(&self, user_id: Uuid) -> StoreResult<Vec<UnreadCounter>> {
        let rows = sqlx::query_as::<_, CounterRow>(
            "SELECT chat_id, user_id, count FROM unread_counters WHERE user_id = $1 ORDER BY chat_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UnreadCounter::from).collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
