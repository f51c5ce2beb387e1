use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::db::manager::Pool;
use crate::db::schema::{chat_channels, chat_messages, chat_rooms, guild_bans, room_permissions};

use super::models::{
    attachments_from_json, attachments_to_json, ChannelBinding, DailyCount, GuildActivityBucket,
    GuildBan, GuildStats, GuildSummary, LiveStats, MessageFilter, MessageLogEntry,
    NewChannelBinding, NewMessageLogEntry, PermissionsPatch, Room, RoomPatch, RoomPermissions,
    RoomStats, RoomWithChannelCount,
};
use super::DatabaseError;

diesel::define_sql_function! { fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text; }

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = chat_rooms)]
struct DbRoom {
    id: i64,
    name: String,
    created_by: String,
    created_at: DateTime<Utc>,
    max_servers: i32,
    is_active: bool,
}

impl From<DbRoom> for Room {
    fn from(value: DbRoom) -> Self {
        Self {
            id: value.id,
            name: value.name,
            created_by: value.created_by,
            created_at: value.created_at,
            max_servers: value.max_servers,
            is_active: value.is_active,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = chat_rooms)]
struct NewDbRoom<'a> {
    name: &'a str,
    created_by: &'a str,
    created_at: &'a DateTime<Utc>,
    max_servers: i32,
    is_active: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = room_permissions)]
struct DbRoomPermissions {
    #[allow(dead_code)]
    id: i64,
    room_id: i64,
    allow_urls: bool,
    allow_files: bool,
    allow_mentions: bool,
    allow_emojis: bool,
    enable_bad_word_filter: bool,
    max_message_length: i32,
    rate_limit_seconds: i32,
    updated_by: String,
    updated_at: DateTime<Utc>,
}

impl From<DbRoomPermissions> for RoomPermissions {
    fn from(value: DbRoomPermissions) -> Self {
        Self {
            room_id: value.room_id,
            allow_urls: value.allow_urls,
            allow_files: value.allow_files,
            allow_mentions: value.allow_mentions,
            allow_emojis: value.allow_emojis,
            enable_bad_word_filter: value.enable_bad_word_filter,
            max_message_length: value.max_message_length,
            rate_limit_seconds: value.rate_limit_seconds,
            updated_by: value.updated_by,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = room_permissions)]
struct NewDbRoomPermissions<'a> {
    room_id: i64,
    allow_urls: bool,
    allow_files: bool,
    allow_mentions: bool,
    allow_emojis: bool,
    enable_bad_word_filter: bool,
    max_message_length: i32,
    rate_limit_seconds: i32,
    updated_by: &'a str,
    updated_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = chat_channels)]
struct DbChannelBinding {
    id: i64,
    room_id: i64,
    guild_id: String,
    channel_id: String,
    guild_name: String,
    channel_name: String,
    registered_by: String,
    registered_at: DateTime<Utc>,
    is_active: bool,
    last_message_at: Option<DateTime<Utc>>,
}

impl From<DbChannelBinding> for ChannelBinding {
    fn from(value: DbChannelBinding) -> Self {
        Self {
            id: value.id,
            room_id: value.room_id,
            guild_id: value.guild_id,
            channel_id: value.channel_id,
            guild_name: value.guild_name,
            channel_name: value.channel_name,
            registered_by: value.registered_by,
            registered_at: value.registered_at,
            is_active: value.is_active,
            last_message_at: value.last_message_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = chat_channels)]
struct NewDbChannelBinding<'a> {
    room_id: i64,
    guild_id: &'a str,
    channel_id: &'a str,
    guild_name: &'a str,
    channel_name: &'a str,
    registered_by: &'a str,
    registered_at: &'a DateTime<Utc>,
    is_active: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = guild_bans)]
struct DbGuildBan {
    id: i64,
    guild_id: String,
    guild_name: String,
    reason: String,
    banned_by: String,
    banned_at: DateTime<Utc>,
    is_active: bool,
    unbanned_at: Option<DateTime<Utc>>,
    unbanned_by: Option<String>,
}

impl From<DbGuildBan> for GuildBan {
    fn from(value: DbGuildBan) -> Self {
        Self {
            id: value.id,
            guild_id: value.guild_id,
            guild_name: value.guild_name,
            reason: value.reason,
            banned_by: value.banned_by,
            banned_at: value.banned_at,
            is_active: value.is_active,
            unbanned_at: value.unbanned_at,
            unbanned_by: value.unbanned_by,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = guild_bans)]
struct NewDbGuildBan<'a> {
    guild_id: &'a str,
    guild_name: &'a str,
    reason: &'a str,
    banned_by: &'a str,
    banned_at: &'a DateTime<Utc>,
    is_active: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = chat_messages)]
struct DbMessageLogEntry {
    id: i64,
    room_id: i64,
    source_guild_id: String,
    source_channel_id: String,
    source_message_id: String,
    author_id: String,
    author_display: String,
    guild_name: String,
    content: String,
    attachments: String,
    reply_to_message_id: Option<String>,
    reply_to_username: Option<String>,
    reply_to_content: Option<String>,
    timestamp: DateTime<Utc>,
    delivered_count: i32,
    failed_count: i32,
}

impl From<DbMessageLogEntry> for MessageLogEntry {
    fn from(value: DbMessageLogEntry) -> Self {
        Self {
            id: value.id,
            room_id: value.room_id,
            source_guild_id: value.source_guild_id,
            source_channel_id: value.source_channel_id,
            source_message_id: value.source_message_id,
            author_id: value.author_id,
            author_display: value.author_display,
            guild_name: value.guild_name,
            content: value.content,
            attachments: attachments_from_json(&value.attachments),
            reply_to_message_id: value.reply_to_message_id,
            reply_to_username: value.reply_to_username,
            reply_to_content: value.reply_to_content,
            timestamp: value.timestamp,
            delivered_count: value.delivered_count,
            failed_count: value.failed_count,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = chat_messages)]
struct NewDbMessageLogEntry<'a> {
    room_id: i64,
    source_guild_id: &'a str,
    source_channel_id: &'a str,
    source_message_id: &'a str,
    author_id: &'a str,
    author_display: &'a str,
    guild_name: &'a str,
    content: &'a str,
    attachments: String,
    reply_to_message_id: Option<&'a str>,
    reply_to_username: Option<&'a str>,
    reply_to_content: Option<&'a str>,
    timestamp: &'a DateTime<Utc>,
    delivered_count: i32,
    failed_count: i32,
}

fn guild_is_banned(conn: &mut PgConnection, guild: &str) -> Result<bool, DatabaseError> {
    use crate::db::schema::guild_bans::dsl::*;
    let banned: i64 = guild_bans
        .filter(guild_id.eq(guild))
        .filter(is_active.eq(true))
        .count()
        .get_result(conn)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    Ok(banned > 0)
}

fn load_room(conn: &mut PgConnection, room: i64) -> Result<Option<Room>, DatabaseError> {
    use crate::db::schema::chat_rooms::dsl::*;
    Ok(chat_rooms
        .filter(id.eq(room))
        .select(DbRoom::as_select())
        .first::<DbRoom>(conn)
        .optional()
        .map_err(|e| DatabaseError::Query(e.to_string()))?
        .map(Room::from))
}

pub struct PostgresRoomStore {
    pool: Pool,
}

impl PostgresRoomStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::RoomStore for PostgresRoomStore {
    async fn create_room(
        &self,
        name: &str,
        created_by: &str,
        max_servers: i32,
    ) -> Result<Room, DatabaseError> {
        if max_servers <= 0 {
            return Err(DatabaseError::LimitInvalid);
        }

        let name = name.to_string();
        let created_by = created_by.to_string();
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<Room, DatabaseError, _>(|conn| {
                let room: DbRoom = {
                    use crate::db::schema::chat_rooms::dsl;
                    let taken: i64 = dsl::chat_rooms
                        .filter(lower(dsl::name).eq(name.to_lowercase()))
                        .filter(dsl::is_active.eq(true))
                        .count()
                        .get_result(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                    if taken > 0 {
                        return Err(DatabaseError::NameTaken);
                    }

                    let now = Utc::now();
                    diesel::insert_into(dsl::chat_rooms)
                        .values(NewDbRoom {
                            name: &name,
                            created_by: &created_by,
                            created_at: &now,
                            max_servers,
                            is_active: true,
                        })
                        .get_result::<DbRoom>(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?
                };

                {
                    use crate::db::schema::room_permissions::dsl;
                    let defaults = RoomPermissions::defaults(room.id, &created_by);
                    diesel::insert_into(dsl::room_permissions)
                        .values(NewDbRoomPermissions {
                            room_id: room.id,
                            allow_urls: defaults.allow_urls,
                            allow_files: defaults.allow_files,
                            allow_mentions: defaults.allow_mentions,
                            allow_emojis: defaults.allow_emojis,
                            enable_bad_word_filter: defaults.enable_bad_word_filter,
                            max_message_length: defaults.max_message_length,
                            rate_limit_seconds: defaults.rate_limit_seconds,
                            updated_by: &created_by,
                            updated_at: &defaults.updated_at,
                        })
                        .execute(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                }

                Ok(room.into())
            })
        })
        .await
    }

    async fn get_room(&self, room_id: i64) -> Result<Option<Room>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| load_room(conn, room_id)).await
    }

    async fn get_room_by_name(&self, room_name: &str) -> Result<Option<Room>, DatabaseError> {
        let room_name = room_name.to_lowercase();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_rooms::dsl::*;
            Ok(chat_rooms
                .filter(lower(name).eq(room_name))
                .filter(is_active.eq(true))
                .select(DbRoom::as_select())
                .first::<DbRoom>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(Room::from))
        })
        .await
    }

    async fn list_rooms(
        &self,
        include_inactive: bool,
    ) -> Result<Vec<RoomWithChannelCount>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            let rooms: Vec<DbRoom> = {
                use crate::db::schema::chat_rooms::dsl::*;
                let mut query = chat_rooms.select(DbRoom::as_select()).into_boxed();
                if !include_inactive {
                    query = query.filter(is_active.eq(true));
                }
                query
                    .order(id.asc())
                    .load(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
            };

            let counts: Vec<(i64, i64)> = {
                use crate::db::schema::chat_channels::dsl::*;
                chat_channels
                    .filter(is_active.eq(true))
                    .group_by(room_id)
                    .select((room_id, diesel::dsl::count_star()))
                    .load(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
            };

            Ok(rooms
                .into_iter()
                .map(|db_room| {
                    let channel_count = counts
                        .iter()
                        .find(|(rid, _)| *rid == db_room.id)
                        .map(|(_, c)| *c)
                        .unwrap_or(0);
                    RoomWithChannelCount {
                        room: db_room.into(),
                        channel_count,
                    }
                })
                .collect())
        })
        .await
    }

    async fn update_room(&self, room_id: i64, patch: &RoomPatch) -> Result<Room, DatabaseError> {
        if let Some(limit) = patch.max_servers {
            if limit <= 0 {
                return Err(DatabaseError::LimitInvalid);
            }
        }

        let patch = patch.clone();
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<Room, DatabaseError, _>(|conn| {
                use crate::db::schema::chat_rooms::dsl;

                let existing = load_room(conn, room_id)?.ok_or(DatabaseError::NotFound)?;

                if let Some(new_name) = &patch.name {
                    let taken: i64 = dsl::chat_rooms
                        .filter(lower(dsl::name).eq(new_name.to_lowercase()))
                        .filter(dsl::is_active.eq(true))
                        .filter(dsl::id.ne(room_id))
                        .count()
                        .get_result(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                    if taken > 0 {
                        return Err(DatabaseError::NameTaken);
                    }
                }

                let updated = diesel::update(dsl::chat_rooms.filter(dsl::id.eq(room_id)))
                    .set((
                        dsl::name.eq(patch.name.as_deref().unwrap_or(&existing.name)),
                        dsl::max_servers.eq(patch.max_servers.unwrap_or(existing.max_servers)),
                        dsl::is_active.eq(patch.is_active.unwrap_or(existing.is_active)),
                    ))
                    .get_result::<DbRoom>(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;

                Ok(updated.into())
            })
        })
        .await
    }

    async fn delete_room(&self, room_id: i64) -> Result<(), DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<(), DatabaseError, _>(|conn| {
                let deleted = {
                    use crate::db::schema::chat_rooms::dsl;
                    diesel::delete(dsl::chat_rooms.filter(dsl::id.eq(room_id)))
                        .execute(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?
                };
                if deleted == 0 {
                    return Err(DatabaseError::NotFound);
                }

                {
                    use crate::db::schema::room_permissions::dsl;
                    diesel::delete(dsl::room_permissions.filter(dsl::room_id.eq(room_id)))
                        .execute(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                }

                {
                    use crate::db::schema::chat_channels::dsl;
                    diesel::update(dsl::chat_channels.filter(dsl::room_id.eq(room_id)))
                        .set(dsl::is_active.eq(false))
                        .execute(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                }

                Ok(())
            })
        })
        .await
    }

    async fn get_permissions(
        &self,
        room: i64,
    ) -> Result<Option<RoomPermissions>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::room_permissions::dsl::*;
            Ok(room_permissions
                .filter(room_id.eq(room))
                .select(DbRoomPermissions::as_select())
                .first::<DbRoomPermissions>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(RoomPermissions::from))
        })
        .await
    }

    async fn update_permissions(
        &self,
        room: i64,
        patch: &PermissionsPatch,
        updated_by_user: &str,
    ) -> Result<RoomPermissions, DatabaseError> {
        let patch = patch.clone();
        let updated_by_user = updated_by_user.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::room_permissions::dsl::*;

            let existing: RoomPermissions = room_permissions
                .filter(room_id.eq(room))
                .select(DbRoomPermissions::as_select())
                .first::<DbRoomPermissions>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .ok_or(DatabaseError::NotFound)?
                .into();

            let updated = diesel::update(room_permissions.filter(room_id.eq(room)))
                .set((
                    allow_urls.eq(patch.allow_urls.unwrap_or(existing.allow_urls)),
                    allow_files.eq(patch.allow_files.unwrap_or(existing.allow_files)),
                    allow_mentions.eq(patch.allow_mentions.unwrap_or(existing.allow_mentions)),
                    allow_emojis.eq(patch.allow_emojis.unwrap_or(existing.allow_emojis)),
                    enable_bad_word_filter
                        .eq(patch
                            .enable_bad_word_filter
                            .unwrap_or(existing.enable_bad_word_filter)),
                    max_message_length.eq(patch
                        .max_message_length
                        .unwrap_or(existing.max_message_length)),
                    rate_limit_seconds.eq(patch
                        .rate_limit_seconds
                        .unwrap_or(existing.rate_limit_seconds)),
                    updated_by.eq(&updated_by_user),
                    updated_at.eq(Utc::now()),
                ))
                .get_result::<DbRoomPermissions>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

            Ok(updated.into())
        })
        .await
    }
}

pub struct PostgresChannelStore {
    pool: Pool,
}

impl PostgresChannelStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::ChannelStore for PostgresChannelStore {
    async fn register_channel(
        &self,
        binding: &NewChannelBinding,
    ) -> Result<ChannelBinding, DatabaseError> {
        let binding = binding.clone();
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<ChannelBinding, DatabaseError, _>(|conn| {
                if guild_is_banned(conn, &binding.guild_id)? {
                    return Err(DatabaseError::GuildBanned);
                }

                let room = load_room(conn, binding.room_id)?.ok_or(DatabaseError::NotFound)?;
                if !room.is_active {
                    return Err(DatabaseError::RoomInactive);
                }

                use crate::db::schema::chat_channels::dsl;

                let bound: i64 = dsl::chat_channels
                    .filter(dsl::guild_id.eq(&binding.guild_id))
                    .filter(dsl::channel_id.eq(&binding.channel_id))
                    .filter(dsl::is_active.eq(true))
                    .count()
                    .get_result(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                if bound > 0 {
                    return Err(DatabaseError::AlreadyBound);
                }

                let guilds: Vec<String> = dsl::chat_channels
                    .filter(dsl::room_id.eq(binding.room_id))
                    .filter(dsl::is_active.eq(true))
                    .select(dsl::guild_id)
                    .distinct()
                    .load(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                if guilds.len() as i32 >= room.max_servers
                    && !guilds.contains(&binding.guild_id)
                {
                    return Err(DatabaseError::RoomFull);
                }

                let now = Utc::now();
                let reused = diesel::update(
                    dsl::chat_channels
                        .filter(dsl::guild_id.eq(&binding.guild_id))
                        .filter(dsl::channel_id.eq(&binding.channel_id)),
                )
                .set((
                    dsl::room_id.eq(binding.room_id),
                    dsl::guild_name.eq(&binding.guild_name),
                    dsl::channel_name.eq(&binding.channel_name),
                    dsl::registered_by.eq(&binding.registered_by),
                    dsl::registered_at.eq(now),
                    dsl::is_active.eq(true),
                    dsl::last_message_at.eq(None::<DateTime<Utc>>),
                ))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

                if reused == 0 {
                    diesel::insert_into(dsl::chat_channels)
                        .values(NewDbChannelBinding {
                            room_id: binding.room_id,
                            guild_id: &binding.guild_id,
                            channel_id: &binding.channel_id,
                            guild_name: &binding.guild_name,
                            channel_name: &binding.channel_name,
                            registered_by: &binding.registered_by,
                            registered_at: &now,
                            is_active: true,
                        })
                        .execute(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                }

                Ok(dsl::chat_channels
                    .filter(dsl::guild_id.eq(&binding.guild_id))
                    .filter(dsl::channel_id.eq(&binding.channel_id))
                    .select(DbChannelBinding::as_select())
                    .first::<DbChannelBinding>(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
                    .into())
            })
        })
        .await
    }

    async fn unregister_channel(
        &self,
        room: i64,
        guild: &str,
        channel: &str,
    ) -> Result<(), DatabaseError> {
        let guild = guild.to_string();
        let channel = channel.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_channels::dsl::*;
            let updated = diesel::update(
                chat_channels
                    .filter(room_id.eq(room))
                    .filter(guild_id.eq(&guild))
                    .filter(channel_id.eq(&channel))
                    .filter(is_active.eq(true)),
            )
            .set(is_active.eq(false))
            .execute(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

            if updated == 0 {
                return Err(DatabaseError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn get_active_binding(
        &self,
        guild: &str,
        channel: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        let guild = guild.to_string();
        let channel = channel.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_channels::dsl::*;
            Ok(chat_channels
                .filter(guild_id.eq(guild))
                .filter(channel_id.eq(channel))
                .filter(is_active.eq(true))
                .select(DbChannelBinding::as_select())
                .first::<DbChannelBinding>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(ChannelBinding::from))
        })
        .await
    }

    async fn list_room_channels(
        &self,
        room: i64,
        active_only: bool,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_channels::dsl::*;
            let mut query = chat_channels
                .filter(room_id.eq(room))
                .select(DbChannelBinding::as_select())
                .into_boxed();
            if active_only {
                query = query.filter(is_active.eq(true));
            }
            Ok(query
                .order(registered_at.asc())
                .load::<DbChannelBinding>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(ChannelBinding::from)
                .collect())
        })
        .await
    }

    async fn list_guild_channels(
        &self,
        guild: &str,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        let guild = guild.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_channels::dsl::*;
            Ok(chat_channels
                .filter(guild_id.eq(guild))
                .order(registered_at.asc())
                .select(DbChannelBinding::as_select())
                .load::<DbChannelBinding>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(ChannelBinding::from)
                .collect())
        })
        .await
    }

    async fn list_guilds(&self, active_only: bool) -> Result<Vec<GuildSummary>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            #[derive(QueryableByName)]
            struct GuildRow {
                #[diesel(sql_type = diesel::sql_types::Text)]
                guild_id: String,
                #[diesel(sql_type = diesel::sql_types::Text)]
                guild_name: String,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                channel_count: i64,
                #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>)]
                last_message_at: Option<DateTime<Utc>>,
            }

            let sql = if active_only {
                "SELECT guild_id, MAX(guild_name) AS guild_name, COUNT(*) AS channel_count, \
                 MAX(last_message_at) AS last_message_at \
                 FROM chat_channels WHERE is_active = TRUE GROUP BY guild_id ORDER BY guild_id"
            } else {
                "SELECT guild_id, MAX(guild_name) AS guild_name, COUNT(*) AS channel_count, \
                 MAX(last_message_at) AS last_message_at \
                 FROM chat_channels GROUP BY guild_id ORDER BY guild_id"
            };

            Ok(diesel::sql_query(sql)
                .load::<GuildRow>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(|row| GuildSummary {
                    guild_id: row.guild_id,
                    guild_name: row.guild_name,
                    channel_count: row.channel_count,
                    last_message_at: row.last_message_at,
                })
                .collect())
        })
        .await
    }

    async fn deactivate_binding(&self, guild: &str, channel: &str) -> Result<(), DatabaseError> {
        let guild = guild.to_string();
        let channel = channel.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_channels::dsl::*;
            diesel::update(
                chat_channels
                    .filter(guild_id.eq(guild))
                    .filter(channel_id.eq(channel)),
            )
            .set(is_active.eq(false))
            .execute(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn touch_last_message(
        &self,
        guild: &str,
        channel: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let guild = guild.to_string();
        let channel = channel.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_channels::dsl::*;
            diesel::update(
                chat_channels
                    .filter(guild_id.eq(guild))
                    .filter(channel_id.eq(channel)),
            )
            .set(last_message_at.eq(at))
            .execute(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

pub struct PostgresBanStore {
    pool: Pool,
}

impl PostgresBanStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::BanStore for PostgresBanStore {
    async fn ban_guild(
        &self,
        guild: &str,
        name: &str,
        ban_reason: &str,
        actor: &str,
    ) -> Result<GuildBan, DatabaseError> {
        let guild = guild.to_string();
        let name = name.to_string();
        let ban_reason = ban_reason.to_string();
        let actor = actor.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::guild_bans::dsl::*;

            let now = Utc::now();
            let reused = diesel::update(guild_bans.filter(guild_id.eq(&guild)))
                .set((
                    guild_name.eq(&name),
                    reason.eq(&ban_reason),
                    banned_by.eq(&actor),
                    banned_at.eq(now),
                    is_active.eq(true),
                    unbanned_at.eq(None::<DateTime<Utc>>),
                    unbanned_by.eq(None::<String>),
                ))
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

            if reused == 0 {
                diesel::insert_into(guild_bans)
                    .values(NewDbGuildBan {
                        guild_id: &guild,
                        guild_name: &name,
                        reason: &ban_reason,
                        banned_by: &actor,
                        banned_at: &now,
                        is_active: true,
                    })
                    .execute(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
            }

            Ok(guild_bans
                .filter(guild_id.eq(&guild))
                .select(DbGuildBan::as_select())
                .first::<DbGuildBan>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into())
        })
        .await
    }

    async fn unban_guild(&self, guild: &str, actor: &str) -> Result<GuildBan, DatabaseError> {
        let guild = guild.to_string();
        let actor = actor.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::guild_bans::dsl::*;

            let updated = diesel::update(
                guild_bans
                    .filter(guild_id.eq(&guild))
                    .filter(is_active.eq(true)),
            )
            .set((
                is_active.eq(false),
                unbanned_at.eq(Some(Utc::now())),
                unbanned_by.eq(Some(actor.clone())),
            ))
            .execute(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

            if updated == 0 {
                return Err(DatabaseError::NotFound);
            }

            Ok(guild_bans
                .filter(guild_id.eq(&guild))
                .select(DbGuildBan::as_select())
                .first::<DbGuildBan>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into())
        })
        .await
    }

    async fn list_bans(&self, include_inactive: bool) -> Result<Vec<GuildBan>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::guild_bans::dsl::*;
            let mut query = guild_bans.select(DbGuildBan::as_select()).into_boxed();
            if !include_inactive {
                query = query.filter(is_active.eq(true));
            }
            Ok(query
                .order(banned_at.desc())
                .load::<DbGuildBan>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(GuildBan::from)
                .collect())
        })
        .await
    }

    async fn is_banned(&self, guild: &str) -> Result<bool, DatabaseError> {
        let guild = guild.to_string();
        with_connection(self.pool.clone(), move |conn| {
            guild_is_banned(conn, &guild)
        })
        .await
    }
}

pub struct PostgresMessageStore {
    pool: Pool,
}

impl PostgresMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::MessageStore for PostgresMessageStore {
    async fn append(&self, entry: &NewMessageLogEntry) -> Result<(), DatabaseError> {
        let entry = entry.clone();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_messages::dsl::*;
            diesel::insert_into(chat_messages)
                .values(NewDbMessageLogEntry {
                    room_id: entry.room_id,
                    source_guild_id: &entry.source_guild_id,
                    source_channel_id: &entry.source_channel_id,
                    source_message_id: &entry.source_message_id,
                    author_id: &entry.author_id,
                    author_display: &entry.author_display,
                    guild_name: &entry.guild_name,
                    content: &entry.content,
                    attachments: attachments_to_json(&entry.attachments),
                    reply_to_message_id: entry.reply_to_message_id.as_deref(),
                    reply_to_username: entry.reply_to_username.as_deref(),
                    reply_to_content: entry.reply_to_content.as_deref(),
                    timestamp: &entry.timestamp,
                    delivered_count: entry.delivered_count,
                    failed_count: entry.failed_count,
                })
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_by_source_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageLogEntry>, DatabaseError> {
        let message_id = message_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_messages::dsl::*;
            Ok(chat_messages
                .filter(source_message_id.eq(message_id))
                .order(id.desc())
                .select(DbMessageLogEntry::as_select())
                .first::<DbMessageLogEntry>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(MessageLogEntry::from))
        })
        .await
    }

    async fn list_room_messages(
        &self,
        room: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_messages::dsl::*;
            Ok(chat_messages
                .filter(room_id.eq(room))
                .order(timestamp.desc())
                .limit(limit)
                .offset(offset)
                .select(DbMessageLogEntry::as_select())
                .load::<DbMessageLogEntry>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(MessageLogEntry::from)
                .collect())
        })
        .await
    }

    async fn live_stats(&self) -> Result<LiveStats, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            #[derive(QueryableByName)]
            struct LiveRow {
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                total_messages: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                messages_today: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                messages_last_hour: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                active_rooms: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                active_channels: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                active_guilds: i64,
            }

            let now = Utc::now();
            let midnight = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default()
                .and_utc();
            let hour_ago = now - Duration::hours(1);

            let row = diesel::sql_query(
                "SELECT \
                 (SELECT COUNT(*) FROM chat_messages) AS total_messages, \
                 (SELECT COUNT(*) FROM chat_messages WHERE timestamp >= $1) AS messages_today, \
                 (SELECT COUNT(*) FROM chat_messages WHERE timestamp >= $2) AS messages_last_hour, \
                 (SELECT COUNT(*) FROM chat_rooms WHERE is_active = TRUE) AS active_rooms, \
                 (SELECT COUNT(*) FROM chat_channels WHERE is_active = TRUE) AS active_channels, \
                 (SELECT COUNT(DISTINCT guild_id) FROM chat_channels WHERE is_active = TRUE) AS active_guilds",
            )
            .bind::<diesel::sql_types::Timestamptz, _>(midnight)
            .bind::<diesel::sql_types::Timestamptz, _>(hour_ago)
            .get_result::<LiveRow>(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

            Ok(LiveStats {
                total_messages: row.total_messages,
                messages_today: row.messages_today,
                messages_last_hour: row.messages_last_hour,
                active_rooms: row.active_rooms,
                active_channels: row.active_channels,
                active_guilds: row.active_guilds,
            })
        })
        .await
    }

    async fn daily_counts(&self, days: i64) -> Result<Vec<DailyCount>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            #[derive(QueryableByName)]
            struct DailyRow {
                #[diesel(sql_type = diesel::sql_types::Text)]
                day: String,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                message_count: i64,
            }

            let cutoff = Utc::now() - Duration::days(days);
            Ok(diesel::sql_query(
                "SELECT to_char(timestamp, 'YYYY-MM-DD') AS day, COUNT(*) AS message_count \
                 FROM chat_messages WHERE timestamp >= $1 \
                 GROUP BY to_char(timestamp, 'YYYY-MM-DD') ORDER BY day",
            )
            .bind::<diesel::sql_types::Timestamptz, _>(cutoff)
            .load::<DailyRow>(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            .into_iter()
            .map(|row| DailyCount {
                day: row.day,
                message_count: row.message_count,
            })
            .collect())
        })
        .await
    }

    async fn room_stats(&self, room: i64, days: i64) -> Result<RoomStats, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
            #[derive(QueryableByName)]
            struct StatsRow {
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                message_count: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                unique_users: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                unique_guilds: i64,
            }

            let cutoff = Utc::now() - Duration::days(days);
            let row = diesel::sql_query(
                "SELECT COUNT(*) AS message_count, \
                 COUNT(DISTINCT author_id) AS unique_users, \
                 COUNT(DISTINCT source_guild_id) AS unique_guilds \
                 FROM chat_messages WHERE room_id = $1 AND timestamp >= $2",
            )
            .bind::<diesel::sql_types::BigInt, _>(room)
            .bind::<diesel::sql_types::Timestamptz, _>(cutoff)
            .get_result::<StatsRow>(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

            Ok(RoomStats {
                room_id: room,
                message_count: row.message_count,
                unique_users: row.unique_users,
                unique_guilds: row.unique_guilds,
            })
        })
        .await
    }

    async fn guild_stats(&self, guild: &str, days: i64) -> Result<GuildStats, DatabaseError> {
        let guild = guild.to_string();
        with_connection(self.pool.clone(), move |conn| {
            #[derive(QueryableByName)]
            struct StatsRow {
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                message_count: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                unique_users: i64,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                rooms_used: i64,
            }

            let cutoff = Utc::now() - Duration::days(days);
            let row = diesel::sql_query(
                "SELECT COUNT(*) AS message_count, \
                 COUNT(DISTINCT author_id) AS unique_users, \
                 COUNT(DISTINCT room_id) AS rooms_used \
                 FROM chat_messages WHERE source_guild_id = $1 AND timestamp >= $2",
            )
            .bind::<diesel::sql_types::Text, _>(&guild)
            .bind::<diesel::sql_types::Timestamptz, _>(cutoff)
            .get_result::<StatsRow>(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

            Ok(GuildStats {
                guild_id: guild,
                message_count: row.message_count,
                unique_users: row.unique_users,
                rooms_used: row.rooms_used,
            })
        })
        .await
    }

    async fn guild_activity(
        &self,
        guild: &str,
        hours: i64,
    ) -> Result<Vec<GuildActivityBucket>, DatabaseError> {
        let guild = guild.to_string();
        with_connection(self.pool.clone(), move |conn| {
            #[derive(QueryableByName)]
            struct BucketRow {
                #[diesel(sql_type = diesel::sql_types::Text)]
                hour: String,
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                message_count: i64,
            }

            let cutoff = Utc::now() - Duration::hours(hours);
            Ok(diesel::sql_query(
                "SELECT to_char(timestamp, 'YYYY-MM-DD\"T\"HH24') AS hour, COUNT(*) AS message_count \
                 FROM chat_messages WHERE source_guild_id = $1 AND timestamp >= $2 \
                 GROUP BY to_char(timestamp, 'YYYY-MM-DD\"T\"HH24') ORDER BY hour",
            )
            .bind::<diesel::sql_types::Text, _>(guild)
            .bind::<diesel::sql_types::Timestamptz, _>(cutoff)
            .load::<BucketRow>(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            .into_iter()
            .map(|row| GuildActivityBucket {
                hour: row.hour,
                message_count: row.message_count,
            })
            .collect())
        })
        .await
    }

    async fn export(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        let filter = filter.clone();
        with_connection(self.pool.clone(), move |conn| {
            use crate::db::schema::chat_messages::dsl::*;
            let mut query = chat_messages
                .select(DbMessageLogEntry::as_select())
                .into_boxed();

            if let Some(room) = filter.room_id {
                query = query.filter(room_id.eq(room));
            }
            if let Some(guild) = &filter.guild_id {
                query = query.filter(source_guild_id.eq(guild.clone()));
            }
            if let Some(since) = filter.since {
                query = query.filter(timestamp.ge(since));
            }
            if let Some(until) = filter.until {
                query = query.filter(timestamp.lt(until));
            }

            Ok(query
                .order(timestamp.desc())
                .limit(filter.limit.clamp(1, 10_000))
                .offset(filter.offset.max(0))
                .load::<DbMessageLogEntry>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(MessageLogEntry::from)
                .collect())
        })
        .await
    }
}
