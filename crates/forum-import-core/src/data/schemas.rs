//! Column layouts of the target forum tables records are written into.

use crate::schema::{Column, ColumnType, TableSchema};

pub const DISCUSSION_STATES: &[&str] = &["visible", "moderated", "deleted"];
pub const NODE_TYPES: &[&str] = &["Category", "Forum", "Page"];

/// Tables written directly by handler side effects rather than through a record writer.
pub const SECONDARY_TABLES: &[&str] =
    &["permission_entry", "template", "thread_watch", "ip", "approval_queue", "deletion_log"];

/// Auto-increment keys of secondary tables, as `(table, column)`.
pub const SECONDARY_AUTO_KEYS: &[(&str, &str)] =
    &[("permission_entry", "permission_entry_id"), ("template", "template_id"), ("ip", "ip_id")];

#[must_use]
pub fn user_group() -> TableSchema {
    TableSchema::new("user_group", "user_group", &["user_group_id"])
        .with_column(Column::new("user_group_id", ColumnType::Uint).auto_increment())
        .with_column(Column::new("title", ColumnType::Str).max_length(50).required())
        .with_column(Column::new("user_title", ColumnType::Str).max_length(100).default_value(""))
        .with_column(Column::new("display_style_priority", ColumnType::Uint).default_value(0))
        .with_column(Column::new("username_css", ColumnType::Str).default_value(""))
}

#[must_use]
pub fn user() -> TableSchema {
    TableSchema::new("user", "user", &["user_id"])
        .with_column(Column::new("user_id", ColumnType::Uint).auto_increment())
        .with_column(Column::new("username", ColumnType::Str).max_length(50).required())
        .with_column(Column::new("email", ColumnType::Str).max_length(120).default_value(""))
        .with_column(Column::new("user_group_id", ColumnType::Uint).default_value(2))
        .with_column(
            Column::new("secondary_group_ids", ColumnType::UintList).default_value(Vec::<i64>::new()),
        )
        .with_column(Column::new("display_style_group_id", ColumnType::Uint).default_value(0))
        .with_column(Column::new("custom_title", ColumnType::Str).max_length(50).default_value(""))
        .with_column(Column::new("register_date", ColumnType::Uint).default_value(0))
        .with_column(Column::new("last_activity", ColumnType::Uint).default_value(0))
        .with_column(Column::new("message_count", ColumnType::Uint).default_value(0))
        .with_column(Column::new("is_admin", ColumnType::Bool).default_value(false))
        .with_column(Column::new("is_moderator", ColumnType::Bool).default_value(false))
        .with_column(Column::new("is_banned", ColumnType::Bool).default_value(false))
        .with_column(
            Column::new("user_state", ColumnType::Str)
                .allowed(&["valid", "email_confirm", "moderated", "rejected", "disabled"])
                .default_value("valid"),
        )
        .with_column(Column::new("timezone", ColumnType::Str).max_length(50).default_value("UTC"))
        .with_column(Column::new("signature", ColumnType::Str).default_value(""))
}

#[must_use]
pub fn node() -> TableSchema {
    TableSchema::new("node", "node", &["node_id"])
        .with_column(Column::new("node_id", ColumnType::Uint).auto_increment())
        .with_column(Column::new("title", ColumnType::Str).max_length(100).required())
        .with_column(Column::new("description", ColumnType::Str).default_value(""))
        .with_column(
            Column::new("node_type_id", ColumnType::Str).max_length(25).allowed(NODE_TYPES).required(),
        )
        .with_column(Column::new("parent_node_id", ColumnType::Uint).default_value(0))
        .with_column(Column::new("display_order", ColumnType::Uint).default_value(1))
        .with_column(Column::new("display_in_list", ColumnType::Bool).default_value(true))
        .with_column(Column::new("lft", ColumnType::Uint).default_value(0))
        .with_column(Column::new("rgt", ColumnType::Uint).default_value(0))
        .with_column(Column::new("depth", ColumnType::Uint).default_value(0))
}

#[must_use]
pub fn forum() -> TableSchema {
    TableSchema::new("forum", "forum", &["node_id"])
        .with_column(Column::new("node_id", ColumnType::Uint))
        .with_column(Column::new("discussion_count", ColumnType::Uint).default_value(0))
        .with_column(Column::new("message_count", ColumnType::Uint).default_value(0))
        .with_column(Column::new("last_post_date", ColumnType::Uint).default_value(0))
        .with_column(Column::new("allow_posting", ColumnType::Bool).default_value(true))
}

#[must_use]
pub fn category() -> TableSchema {
    TableSchema::new("category", "category", &["node_id"])
        .with_column(Column::new("node_id", ColumnType::Uint))
}

#[must_use]
pub fn page() -> TableSchema {
    TableSchema::new("page", "page", &["node_id"])
        .with_column(Column::new("node_id", ColumnType::Uint))
        .with_column(Column::new("publish_date", ColumnType::Uint).default_value(0))
        .with_column(Column::new("modified_date", ColumnType::Uint).default_value(0))
        .with_column(Column::new("view_count", ColumnType::Uint).default_value(0))
}

#[must_use]
pub fn thread() -> TableSchema {
    TableSchema::new("thread", "thread", &["thread_id"])
        .with_column(Column::new("thread_id", ColumnType::Uint).auto_increment())
        .with_column(Column::new("node_id", ColumnType::Uint).required())
        .with_column(Column::new("title", ColumnType::Str).max_length(150).required())
        .with_column(Column::new("user_id", ColumnType::Uint).default_value(0))
        .with_column(Column::new("username", ColumnType::Str).max_length(50).required())
        .with_column(Column::new("post_date", ColumnType::Uint).required())
        .with_column(Column::new("reply_count", ColumnType::Uint).default_value(0))
        .with_column(Column::new("view_count", ColumnType::Uint).default_value(0))
        .with_column(Column::new("sticky", ColumnType::Bool).default_value(false))
        .with_column(Column::new("discussion_open", ColumnType::Bool).default_value(true))
        .with_column(
            Column::new("discussion_state", ColumnType::Str)
                .allowed(DISCUSSION_STATES)
                .default_value("visible"),
        )
        .with_column(Column::new("last_post_date", ColumnType::Uint).default_value(0))
}

#[must_use]
pub fn post() -> TableSchema {
    TableSchema::new("post", "post", &["post_id"])
        .with_column(Column::new("post_id", ColumnType::Uint).auto_increment())
        .with_column(Column::new("thread_id", ColumnType::Uint).required())
        .with_column(Column::new("user_id", ColumnType::Uint).default_value(0))
        .with_column(Column::new("username", ColumnType::Str).max_length(50).required())
        .with_column(Column::new("post_date", ColumnType::Uint).required())
        .with_column(Column::new("message", ColumnType::Str).required())
        .with_column(
            Column::new("message_state", ColumnType::Str)
                .allowed(DISCUSSION_STATES)
                .default_value("visible"),
        )
        .with_column(Column::new("position", ColumnType::Uint).default_value(0))
        .with_column(Column::new("ip_id", ColumnType::Uint).default_value(0))
        .with_column(Column::new("last_edit_date", ColumnType::Uint).default_value(0))
        .with_column(Column::new("last_edit_user_id", ColumnType::Uint).default_value(0))
        .with_column(Column::new("edit_count", ColumnType::Uint).default_value(0))
}

#[must_use]
pub fn moderator() -> TableSchema {
    TableSchema::new("moderator", "moderator", &["user_id"])
        .with_column(Column::new("user_id", ColumnType::Uint))
        .with_column(Column::new("is_super_moderator", ColumnType::Bool).default_value(false))
        .with_column(
            Column::new("extra_user_group_ids", ColumnType::UintList)
                .default_value(Vec::<i64>::new()),
        )
}
