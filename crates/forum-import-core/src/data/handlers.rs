use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;

use crate::error::{ImportError, ImportResult};
use crate::handler::{DeferredTask, ImportHandler, ImportTarget, RecordHandler};
use crate::permissions::{PermissionSet, PermissionValue};
use crate::registry::RegisteredHandler;
use crate::schema::TableSchema;
use crate::text::TextConverter;
use crate::value::{Row, Value};
use crate::writer::RecordWriter;

macro_rules! record_handler {
    ($handler:ty) => {
        impl RecordHandler for $handler {
            fn record(&self) -> &RecordWriter {
                &self.record
            }

            fn record_mut(&mut self) -> &mut RecordWriter {
                &mut self.record
            }
        }
    };
}

fn insert_record(
    record: &mut RecordWriter,
    legacy_id: Option<i64>,
    target: &mut ImportTarget<'_>,
) -> ImportResult<Option<i64>> {
    let retain_ids = target.retain_ids();
    record.insert(legacy_id, target.store(), retain_ids).map(Some)
}

fn row<const N: usize>(values: [(&str, Value); N]) -> Row {
    values.into_iter().map(|(column, value)| (column.to_string(), value)).collect()
}

/// Logs an address against the content it was recorded with and returns the `ip` row id.
///
/// Unparseable addresses are skipped rather than failing the record.
fn log_ip(
    target: &mut ImportTarget<'_>,
    user_id: i64,
    content_type: &str,
    content_id: i64,
    action: &str,
    address: &str,
    log_date: i64,
) -> ImportResult<Option<i64>> {
    let Ok(parsed) = address.trim().parse::<IpAddr>() else {
        warn!(content_type, content_id, address, "skipping unparseable ip address");
        return Ok(None);
    };
    let packed = match parsed {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };

    let ip_id = target.store().insert(
        "ip",
        &row([
            ("user_id", Value::Int(user_id)),
            ("content_type", Value::from(content_type)),
            ("content_id", Value::Int(content_id)),
            ("action", Value::from(action)),
            ("ip", Value::Bytes(packed)),
            ("log_date", Value::Int(log_date)),
        ]),
    )?;
    Ok(Some(ip_id))
}

/// Adds the approval queue or deletion log entry that moderated and deleted content carries.
fn insert_state_record(
    target: &mut ImportTarget<'_>,
    content_type: &str,
    content_id: i64,
    state: &str,
    content_date: i64,
) -> ImportResult<()> {
    match state {
        "moderated" => {
            target.store().insert(
                "approval_queue",
                &row([
                    ("content_type", Value::from(content_type)),
                    ("content_id", Value::Int(content_id)),
                    ("content_date", Value::Int(content_date)),
                ]),
            )?;
        }
        "deleted" => {
            target.store().insert(
                "deletion_log",
                &row([
                    ("content_type", Value::from(content_type)),
                    ("content_id", Value::Int(content_id)),
                    ("delete_date", Value::Int(content_date)),
                    ("delete_user_id", Value::Int(0)),
                    ("delete_username", Value::from("")),
                    ("delete_reason", Value::from("")),
                ]),
            )?;
        }
        _ => {}
    }
    Ok(())
}

/// Record writer with no side effects, logged under its schema's entity type.
#[derive(Debug)]
pub struct PlainHandler {
    import_type: String,
    record: RecordWriter,
}

impl PlainHandler {
    /// # Errors
    /// Returns `ImportError::Configuration` when the schema has no single primary key.
    pub fn new(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self> {
        let import_type = schema.entity_type().to_string();
        Ok(Self { import_type, record: RecordWriter::new(schema, text)? })
    }
}

impl ImportHandler for PlainHandler {
    fn import_type(&self) -> &str {
        &self.import_type
    }

    fn write(
        &mut self,
        legacy_id: Option<i64>,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<Option<i64>> {
        insert_record(&mut self.record, legacy_id, target)
    }
}

record_handler!(PlainHandler);

#[derive(Debug)]
pub struct UserGroupHandler {
    record: RecordWriter,
    permissions: PermissionSet,
}

impl UserGroupHandler {
    pub fn set_permissions(&mut self, permissions: PermissionSet) {
        self.permissions = permissions;
    }
}

impl RegisteredHandler for UserGroupHandler {
    const ENTITY_TYPE: &'static str = "user_group";

    fn build(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self> {
        Ok(Self { record: RecordWriter::new(schema, text)?, permissions: PermissionSet::default() })
    }
}

impl ImportHandler for UserGroupHandler {
    fn import_type(&self) -> &str {
        Self::ENTITY_TYPE
    }

    fn write(
        &mut self,
        legacy_id: Option<i64>,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<Option<i64>> {
        insert_record(&mut self.record, legacy_id, target)
    }

    fn post_save(
        &mut self,
        _legacy_id: Option<i64>,
        new_id: i64,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<()> {
        for (permission, value) in self.permissions.iter() {
            if value == PermissionValue::Unset {
                continue;
            }
            target.store().insert(
                "permission_entry",
                &row([
                    ("user_group_id", Value::Int(new_id)),
                    ("user_id", Value::Int(0)),
                    ("permission_group_id", Value::from(permission.group.as_str())),
                    ("permission_id", Value::from(permission.permission.as_str())),
                    ("permission_value", Value::from(value.as_str())),
                    ("permission_value_int", Value::Int(0)),
                ]),
            )?;
        }
        Ok(())
    }
}

record_handler!(UserGroupHandler);

#[derive(Debug)]
pub struct UserHandler {
    record: RecordWriter,
    register_ip: Option<String>,
}

impl UserHandler {
    pub fn set_register_ip(&mut self, address: &str) {
        if !address.trim().is_empty() {
            self.register_ip = Some(address.to_string());
        }
    }
}

impl RegisteredHandler for UserHandler {
    const ENTITY_TYPE: &'static str = "user";

    fn build(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self> {
        Ok(Self { record: RecordWriter::new(schema, text)?, register_ip: None })
    }
}

impl ImportHandler for UserHandler {
    fn import_type(&self) -> &str {
        Self::ENTITY_TYPE
    }

    fn write(
        &mut self,
        legacy_id: Option<i64>,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<Option<i64>> {
        insert_record(&mut self.record, legacy_id, target)
    }

    fn post_save(
        &mut self,
        _legacy_id: Option<i64>,
        new_id: i64,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<()> {
        if let Some(address) = self.register_ip.take() {
            let register_date = self.record.get_or_null("register_date").as_i64().unwrap_or(0);
            log_ip(target, new_id, "user", new_id, "register", &address, register_date)?;
        }
        Ok(())
    }
}

record_handler!(UserHandler);

/// Node record plus the type-specific record (forum, category, page) saved after it.
pub struct NodeHandler {
    record: RecordWriter,
    type_data: Option<Box<dyn RecordHandler>>,
}

impl NodeHandler {
    /// Attaches the type record and sets `node_type_id` to match.
    ///
    /// # Errors
    /// Returns `ImportError::Validation` for node types the target does not know.
    pub fn set_type_data(
        &mut self,
        node_type_id: &str,
        type_data: Box<dyn RecordHandler>,
    ) -> ImportResult<()> {
        self.record.set("node_type_id", node_type_id)?;
        self.type_data = Some(type_data);
        Ok(())
    }
}

impl RegisteredHandler for NodeHandler {
    const ENTITY_TYPE: &'static str = "node";

    fn build(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self> {
        Ok(Self { record: RecordWriter::new(schema, text)?, type_data: None })
    }
}

impl ImportHandler for NodeHandler {
    fn import_type(&self) -> &str {
        Self::ENTITY_TYPE
    }

    fn pre_save(&mut self, _legacy_id: Option<i64>) -> ImportResult<bool> {
        if self.type_data.is_none() {
            return Err(ImportError::Configuration(
                "node records must be given type data before saving".to_string(),
            ));
        }
        Ok(true)
    }

    fn write(
        &mut self,
        legacy_id: Option<i64>,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<Option<i64>> {
        insert_record(&mut self.record, legacy_id, target)
    }

    fn post_save(
        &mut self,
        legacy_id: Option<i64>,
        new_id: i64,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<()> {
        let Some(mut type_data) = self.type_data.take() else {
            return Ok(());
        };
        type_data.set("node_id", Value::Int(new_id))?;
        target.save(type_data.as_mut(), legacy_id)?;
        target.defer(DeferredTask::RebuildNodeTree);
        Ok(())
    }
}

record_handler!(NodeHandler);

/// Page node type data; the page body is stored as a template named after the node.
#[derive(Debug)]
pub struct PageHandler {
    record: RecordWriter,
    content: Option<String>,
    text: TextConverter,
}

impl PageHandler {
    pub fn set_content(&mut self, content: &str) {
        self.content = Some(self.text.convert_str(content));
    }
}

impl RegisteredHandler for PageHandler {
    const ENTITY_TYPE: &'static str = "page";

    fn build(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self> {
        Ok(Self { record: RecordWriter::new(schema, text)?, content: None, text })
    }
}

impl ImportHandler for PageHandler {
    fn import_type(&self) -> &str {
        Self::ENTITY_TYPE
    }

    fn pre_save(&mut self, _legacy_id: Option<i64>) -> ImportResult<bool> {
        Ok(self.content.is_some())
    }

    fn write(
        &mut self,
        legacy_id: Option<i64>,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<Option<i64>> {
        insert_record(&mut self.record, legacy_id, target)
    }

    fn post_save(
        &mut self,
        _legacy_id: Option<i64>,
        new_id: i64,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<()> {
        let content = self.content.clone().unwrap_or_default();
        target.store().insert(
            "template",
            &row([
                ("title", Value::from(format!("_page_node.{new_id}"))),
                ("type", Value::from("public")),
                ("style_id", Value::Int(0)),
                ("template", Value::from(content)),
            ]),
        )?;
        Ok(())
    }
}

record_handler!(PageHandler);

#[derive(Debug)]
pub struct ThreadHandler {
    record: RecordWriter,
    watchers: Vec<(i64, bool)>,
}

impl ThreadHandler {
    /// Adds a watcher by target user id. Zero ids are ignored.
    pub fn add_watcher(&mut self, user_id: i64, email_subscribe: bool) {
        if user_id > 0 && !self.watchers.iter().any(|(existing, _)| *existing == user_id) {
            self.watchers.push((user_id, email_subscribe));
        }
    }
}

impl RegisteredHandler for ThreadHandler {
    const ENTITY_TYPE: &'static str = "thread";

    fn build(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self> {
        Ok(Self { record: RecordWriter::new(schema, text)?, watchers: Vec::new() })
    }
}

impl ImportHandler for ThreadHandler {
    fn import_type(&self) -> &str {
        Self::ENTITY_TYPE
    }

    fn write(
        &mut self,
        legacy_id: Option<i64>,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<Option<i64>> {
        insert_record(&mut self.record, legacy_id, target)
    }

    fn post_save(
        &mut self,
        _legacy_id: Option<i64>,
        new_id: i64,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<()> {
        for (user_id, email_subscribe) in &self.watchers {
            target.store().insert(
                "thread_watch",
                &row([
                    ("user_id", Value::Int(*user_id)),
                    ("thread_id", Value::Int(new_id)),
                    ("email_subscribe", Value::Int(i64::from(*email_subscribe))),
                ]),
            )?;
        }

        let state = self.record.get_or_null("discussion_state").to_string();
        let post_date = self.record.get_or_null("post_date").as_i64().unwrap_or(0);
        insert_state_record(target, "thread", new_id, &state, post_date)
    }
}

record_handler!(ThreadHandler);

#[derive(Debug)]
pub struct PostHandler {
    record: RecordWriter,
    ip: Option<String>,
}

impl PostHandler {
    pub fn set_ip(&mut self, address: &str) {
        if !address.trim().is_empty() {
            self.ip = Some(address.to_string());
        }
    }
}

impl RegisteredHandler for PostHandler {
    const ENTITY_TYPE: &'static str = "post";

    fn build(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self> {
        Ok(Self { record: RecordWriter::new(schema, text)?, ip: None })
    }
}

impl ImportHandler for PostHandler {
    fn import_type(&self) -> &str {
        Self::ENTITY_TYPE
    }

    fn write(
        &mut self,
        legacy_id: Option<i64>,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<Option<i64>> {
        insert_record(&mut self.record, legacy_id, target)
    }

    fn post_save(
        &mut self,
        _legacy_id: Option<i64>,
        new_id: i64,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<()> {
        let post_date = self.record.get_or_null("post_date").as_i64().unwrap_or(0);

        if let Some(address) = self.ip.take() {
            let user_id = self.record.get_or_null("user_id").as_i64().unwrap_or(0);
            if let Some(ip_id) = log_ip(target, user_id, "post", new_id, "insert", &address, post_date)? {
                self.record.set("ip_id", ip_id)?;
                target.store().update(
                    "post",
                    &row([("ip_id", Value::Int(ip_id))]),
                    "post_id",
                    new_id,
                )?;
            }
        }

        let state = self.record.get_or_null("message_state").to_string();
        insert_state_record(target, "post", new_id, &state, post_date)
    }
}

record_handler!(PostHandler);
