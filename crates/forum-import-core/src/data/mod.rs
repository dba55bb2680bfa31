mod handlers;
mod node_tree;
pub mod schemas;

pub use handlers::{
    NodeHandler, PageHandler, PlainHandler, PostHandler, ThreadHandler, UserGroupHandler,
    UserHandler,
};
pub use node_tree::{compute_nested_set, rebuild_node_tree, NestedSetPosition};

use crate::error::ImportResult;
use crate::registry::HandlerRegistry;

/// Registry with a handler for every target forum entity.
///
/// # Errors
/// Returns `ImportError::Configuration` if a built-in schema is malformed.
pub fn target_registry() -> ImportResult<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register_handler::<UserGroupHandler>(schemas::user_group())?;
    registry.register_handler::<UserHandler>(schemas::user())?;
    registry.register_handler::<NodeHandler>(schemas::node())?;
    registry.register_plain(schemas::forum())?;
    registry.register_plain(schemas::category())?;
    registry.register_handler::<PageHandler>(schemas::page())?;
    registry.register_handler::<ThreadHandler>(schemas::thread())?;
    registry.register_handler::<PostHandler>(schemas::post())?;
    registry.register_plain(schemas::moderator())?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;
    use crate::handler::{DeferredTask, ImportTarget, RecordHandler, SaveOutcome};
    use crate::memory::MemoryStore;
    use crate::permissions::PermissionBitMap;
    use crate::text::TextConverter;
    use crate::value::{RowExt, Value};

    fn fixture() -> (HandlerRegistry, MemoryStore) {
        let registry =
            target_registry().unwrap_or_else(|err| panic!("target registry should build: {err}"));
        let store = MemoryStore::for_registry(&registry);
        (registry, store)
    }

    #[test]
    fn node_saves_type_data_under_same_legacy_id_and_defers_tree_rebuild() -> ImportResult<()> {
        let (registry, mut store) = fixture();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());

        let mut node: NodeHandler = target.handler()?;
        node.set("title", Value::from("Announcements"))?;
        let forum = target.new_handler("forum")?;
        node.set_type_data("Forum", forum)?;

        let outcome = target.save(&mut node, Some(12))?;
        assert_eq!(outcome, SaveOutcome::Inserted(1));
        assert_eq!(target.lookup("forum", 12)?, Some(1));
        assert_eq!(target.lookup("node", 12)?, Some(1));
        assert!(target.take_deferred().contains(&DeferredTask::RebuildNodeTree));

        assert_eq!(store.rows("forum")[0].int("node_id"), 1);
        Ok(())
    }

    #[test]
    fn node_without_type_data_is_rejected() -> ImportResult<()> {
        let (registry, mut store) = fixture();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());
        let mut node: NodeHandler = target.handler()?;
        node.set("title", Value::from("Lost"))?;
        assert!(matches!(target.save(&mut node, Some(1)), Err(ImportError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn page_without_content_is_skipped_before_writing() -> ImportResult<()> {
        let (registry, mut store) = fixture();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());
        let mut page: PageHandler = target.handler()?;
        page.set("node_id", Value::Int(4))?;
        assert_eq!(target.save(&mut page, Some(4))?, SaveOutcome::Skipped);

        page.set_content("<p>Rules</p>");
        assert_eq!(target.save(&mut page, Some(4))?, SaveOutcome::Inserted(4));
        let templates = store.rows("template");
        assert_eq!(templates[0].text("title"), "_page_node.4");
        assert_eq!(templates[0].text("template"), "<p>Rules</p>");
        Ok(())
    }

    #[test]
    fn thread_watchers_and_state_records_are_written() -> ImportResult<()> {
        let (registry, mut store) = fixture();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());
        let mut thread: ThreadHandler = target.handler()?;
        thread.set("node_id", Value::Int(2))?;
        thread.set("title", Value::from("Hello"))?;
        thread.set("username", Value::from("alice"))?;
        thread.set("post_date", Value::Int(1_000))?;
        thread.set("discussion_state", Value::from("moderated"))?;
        thread.add_watcher(5, true);
        thread.add_watcher(5, false);
        thread.add_watcher(0, true);

        target.save(&mut thread, Some(30))?;
        assert_eq!(store.rows("thread_watch").len(), 1);
        assert_eq!(store.rows("approval_queue")[0].text("content_type"), "thread");
        Ok(())
    }

    #[test]
    fn post_ip_is_logged_and_linked() -> ImportResult<()> {
        let (registry, mut store) = fixture();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());
        let mut post: PostHandler = target.handler()?;
        post.set("thread_id", Value::Int(1))?;
        post.set("username", Value::from("bob"))?;
        post.set("post_date", Value::Int(2_000))?;
        post.set("message", Value::from("first!"))?;
        post.set("message_state", Value::from("deleted"))?;
        post.set_ip("10.0.0.7");

        let post_id = target.save(&mut post, Some(900))?.new_id().unwrap_or(0);
        let ips = store.rows("ip");
        assert_eq!(ips[0].value("ip"), Value::Bytes(vec![10, 0, 0, 7]));
        let ip_id = ips[0].int("ip_id");
        let posts = store.rows("post");
        assert_eq!(posts[0].int("post_id"), post_id);
        assert_eq!(posts[0].int("ip_id"), ip_id);
        assert_eq!(store.rows("deletion_log").len(), 1);
        Ok(())
    }

    #[test]
    fn user_group_permissions_are_expanded_into_entries() -> ImportResult<()> {
        let (registry, mut store) = fixture();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());
        let mut group: UserGroupHandler = target.handler()?;
        group.set("title", Value::from("Members"))?;
        let map = PermissionBitMap::new().with(0, "general", "view").with(1, "forum", "postThread");
        group.set_permissions(map.apply(0b01));

        target.save(&mut group, Some(9))?;
        let entries = store.rows("permission_entry");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text("permission_id"), "view");
        Ok(())
    }

    #[test]
    fn moderator_requires_explicit_user_id() -> ImportResult<()> {
        let (registry, mut store) = fixture();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());
        let mut moderator = target.new_handler("moderator")?;
        assert!(matches!(
            target.save(moderator.as_mut(), Some(3)),
            Err(ImportError::Configuration(_))
        ));
        moderator.set("user_id", Value::Int(44))?;
        assert_eq!(target.save(moderator.as_mut(), Some(3))?, SaveOutcome::Inserted(44));
        Ok(())
    }
}
