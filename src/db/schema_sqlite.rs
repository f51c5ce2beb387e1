diesel::table! {
    chat_rooms (id) {
        id -> Integer,
        name -> Text,
        created_by -> Text,
        created_at -> Text,
        max_servers -> Integer,
        is_active -> Bool,
    }
}

diesel::table! {
    room_permissions (id) {
        id -> Integer,
        room_id -> Integer,
        allow_urls -> Bool,
        allow_files -> Bool,
        allow_mentions -> Bool,
        allow_emojis -> Bool,
        enable_bad_word_filter -> Bool,
        max_message_length -> Integer,
        rate_limit_seconds -> Integer,
        updated_by -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    chat_channels (id) {
        id -> Integer,
        room_id -> Integer,
        guild_id -> Text,
        channel_id -> Text,
        guild_name -> Text,
        channel_name -> Text,
        registered_by -> Text,
        registered_at -> Text,
        is_active -> Bool,
        last_message_at -> Nullable<Text>,
    }
}

diesel::table! {
    guild_bans (id) {
        id -> Integer,
        guild_id -> Text,
        guild_name -> Text,
        reason -> Text,
        banned_by -> Text,
        banned_at -> Text,
        is_active -> Bool,
        unbanned_at -> Nullable<Text>,
        unbanned_by -> Nullable<Text>,
    }
}

diesel::table! {
    chat_messages (id) {
        id -> Integer,
        room_id -> Integer,
        source_guild_id -> Text,
        source_channel_id -> Text,
        source_message_id -> Text,
        author_id -> Text,
        author_display -> Text,
        guild_name -> Text,
        content -> Text,
        attachments -> Text,
        reply_to_message_id -> Nullable<Text>,
        reply_to_username -> Nullable<Text>,
        reply_to_content -> Nullable<Text>,
        timestamp -> Text,
        delivered_count -> Integer,
        failed_count -> Integer,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    chat_rooms,
    room_permissions,
    chat_channels,
    guild_bans,
    chat_messages,
);
