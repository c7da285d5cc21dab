//! PostgreSQL 存储实现
//!
//! 广播房间的发言队列和发言者集合以 JSON 数组文本入库，
//! 序列化只发生在这里这一层边界上。

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use domain::{
    ChatStore, Message, MessageKind, RepositoryError, RepositoryResult, Room, RoomId,
    RoomMembership, User, UserId, UserRole,
};

/// PostgreSQL 存储
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::PoolTimedOut => {
            RepositoryError::ConnectionError("connection pool timed out".to_string())
        }
        sqlx::Error::Io(io) => RepositoryError::ConnectionError(io.to_string()),
        other => RepositoryError::QueryError(other.to_string()),
    }
}

fn role_from_str(value: &str) -> UserRole {
    match value {
        "member" => UserRole::Member,
        "moderator" => UserRole::Moderator,
        "admin" => UserRole::Admin,
        "owner" => UserRole::Owner,
        _ => UserRole::Guest,
    }
}

fn role_to_str(role: UserRole) -> &'static str {
    match role {
        UserRole::Guest => "guest",
        UserRole::Member => "member",
        UserRole::Moderator => "moderator",
        UserRole::Admin => "admin",
        UserRole::Owner => "owner",
    }
}

fn kind_from_str(value: &str) -> MessageKind {
    match value {
        "image" => MessageKind::Image,
        "system" => MessageKind::System,
        _ => MessageKind::Text,
    }
}

fn kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::System => "system",
    }
}

fn decode_user_ids(json: &str) -> RepositoryResult<Vec<UserId>> {
    let ids: Vec<Uuid> = serde_json::from_str(json)
        .map_err(|err| RepositoryError::SerializationError(err.to_string()))?;
    Ok(ids.into_iter().map(UserId::new).collect())
}

fn encode_user_ids(ids: &[UserId]) -> RepositoryResult<String> {
    let raw: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
    serde_json::to_string(&raw)
        .map_err(|err| RepositoryError::SerializationError(err.to_string()))
}

fn user_from_row(row: &PgRow) -> RepositoryResult<User> {
    let role: String = row.try_get("role").map_err(map_sqlx)?;
    Ok(User {
        id: UserId::new(row.try_get("id").map_err(map_sqlx)?),
        username: row.try_get("username").map_err(map_sqlx)?,
        role: role_from_str(&role),
        is_online: row.try_get("is_online").map_err(map_sqlx)?,
        muted_until: row.try_get("muted_until").map_err(map_sqlx)?,
        is_banned: row.try_get("is_banned").map_err(map_sqlx)?,
        banned_until: row.try_get("banned_until").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn room_from_row(row: &PgRow) -> RepositoryResult<Room> {
    let id: String = row.try_get("id").map_err(map_sqlx)?;
    let id = RoomId::parse(id)
        .map_err(|err| RepositoryError::SerializationError(err.to_string()))?;
    let speak_queue: String = row.try_get("speak_queue").map_err(map_sqlx)?;
    let speakers: String = row.try_get("speakers").map_err(map_sqlx)?;
    let host_id: Option<Uuid> = row.try_get("host_id").map_err(map_sqlx)?;
    let max_users: i32 = row.try_get("max_users").map_err(map_sqlx)?;

    Ok(Room {
        id,
        name: row.try_get("name").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        created_by: UserId::new(row.try_get("created_by").map_err(map_sqlx)?),
        is_default: row.try_get("is_default").map_err(map_sqlx)?,
        is_active: row.try_get("is_active").map_err(map_sqlx)?,
        is_private: row.try_get("is_private").map_err(map_sqlx)?,
        password: row.try_get("password").map_err(map_sqlx)?,
        max_users: max_users.max(1) as u32,
        is_broadcast: row.try_get("is_broadcast").map_err(map_sqlx)?,
        host_id: host_id.map(UserId::new),
        speak_queue: decode_user_ids(&speak_queue)?,
        speakers: decode_user_ids(&speakers)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn get_user(&self, user_id: UserId) -> RepositoryResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, role, is_online, muted_until, is_banned, banned_until, created_at \
             FROM users WHERE id = $1",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_user_online_status(
        &self,
        user_id: UserId,
        is_online: bool,
    ) -> RepositoryResult<()> {
        let result = sqlx::query("UPDATE users SET is_online = $2 WHERE id = $1")
            .bind(user_id.0)
            .bind(is_online)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("user"));
        }
        Ok(())
    }

    async fn create_room(&self, room: &Room) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO rooms \
             (id, name, description, created_by, is_default, is_active, is_private, password, \
              max_users, is_broadcast, host_id, speak_queue, speakers, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(room.id.as_str())
        .bind(&room.name)
        .bind(&room.description)
        .bind(room.created_by.0)
        .bind(room.is_default)
        .bind(room.is_active)
        .bind(room.is_private)
        .bind(&room.password)
        .bind(room.max_users as i32)
        .bind(room.is_broadcast)
        .bind(room.host_id.map(|id| id.0))
        .bind(encode_user_ids(&room.speak_queue)?)
        .bind(encode_user_ids(&room.speakers)?)
        .bind(room.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::conflict("room")
            }
            _ => map_sqlx(err),
        })?;
        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> RepositoryResult<Option<Room>> {
        let row = sqlx::query("SELECT * FROM rooms WHERE id = $1")
            .bind(room_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(room_from_row).transpose()
    }

    async fn list_rooms(&self) -> RepositoryResult<Vec<Room>> {
        let rows = sqlx::query("SELECT * FROM rooms ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.iter().map(room_from_row).collect()
    }

    async fn update_room(&self, room: &Room) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE rooms SET \
             name = $2, description = $3, is_active = $4, is_private = $5, password = $6, \
             max_users = $7, is_broadcast = $8, host_id = $9, speak_queue = $10, speakers = $11 \
             WHERE id = $1",
        )
        .bind(room.id.as_str())
        .bind(&room.name)
        .bind(&room.description)
        .bind(room.is_active)
        .bind(room.is_private)
        .bind(&room.password)
        .bind(room.max_users as i32)
        .bind(room.is_broadcast)
        .bind(room.host_id.map(|id| id.0))
        .bind(encode_user_ids(&room.speak_queue)?)
        .bind(encode_user_ids(&room.speakers)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("room"));
        }
        Ok(())
    }

    async fn delete_room(&self, room_id: &RoomId) -> RepositoryResult<()> {
        // 成员关系由外键级联删除
        sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn add_membership(&self, membership: &RoomMembership) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO room_members (room_id, user_id, joined_at) VALUES ($1, $2, $3) \
             ON CONFLICT (room_id, user_id) DO NOTHING",
        )
        .bind(membership.room_id.as_str())
        .bind(membership.user_id.0)
        .bind(membership.joined_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn remove_membership(
        &self,
        room_id: &RoomId,
        user_id: UserId,
    ) -> RepositoryResult<bool> {
        let result =
            sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
                .bind(room_id.as_str())
                .bind(user_id.0)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_member(&self, room_id: &RoomId, user_id: UserId) -> RepositoryResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2) AS present",
        )
        .bind(room_id.as_str())
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.try_get("present").map_err(map_sqlx)
    }

    async fn list_members(&self, room_id: &RoomId) -> RepositoryResult<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM room_members WHERE room_id = $1 ORDER BY joined_at",
        )
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("user_id")
                    .map(UserId::new)
                    .map_err(map_sqlx)
            })
            .collect()
    }

    async fn member_count(&self, room_id: &RoomId) -> RepositoryResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM room_members WHERE room_id = $1")
            .bind(room_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let total: i64 = row.try_get("total").map_err(map_sqlx)?;
        Ok(total.max(0) as usize)
    }

    async fn create_message(&self, message: &Message) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO messages \
             (id, room_id, receiver_id, sender_id, sender_name, content, kind, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(message.id.0)
        .bind(message.room_id.as_ref().map(|id| id.as_str()))
        .bind(message.receiver_id.map(|id| id.0))
        .bind(message.sender_id.0)
        .bind(&message.sender_name)
        .bind(&message.content)
        .bind(kind_to_str(message.kind))
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_mapping_round_trip() {
        for role in [
            UserRole::Guest,
            UserRole::Member,
            UserRole::Moderator,
            UserRole::Admin,
            UserRole::Owner,
        ] {
            assert_eq!(role_from_str(role_to_str(role)), role);
        }
        // 未知值回落到最低权限
        assert_eq!(role_from_str("superuser"), UserRole::Guest);
    }

    #[test]
    fn test_speaker_list_serialization_edge() {
        let ids = vec![UserId::generate(), UserId::generate()];
        let json = encode_user_ids(&ids).unwrap();
        assert_eq!(decode_user_ids(&json).unwrap(), ids);

        assert_eq!(decode_user_ids("[]").unwrap(), Vec::<UserId>::new());
        assert!(decode_user_ids("not json").is_err());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(kind_from_str("image"), MessageKind::Image);
        assert_eq!(kind_from_str("weird"), MessageKind::Text);
        assert_eq!(kind_to_str(MessageKind::System), "system");
    }
}
