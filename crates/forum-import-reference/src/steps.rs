use std::collections::{BTreeMap, BTreeSet};

use forum_import_core::data::{
    NodeHandler, PageHandler, PostHandler, ThreadHandler, UserGroupHandler, UserHandler,
};
use forum_import_core::permissions::PermissionBitMap;
use forum_import_core::{
    DeferredTask, ImportHandler, ImportResult, RecordHandler, Row, RowExt, SaveOutcome, SourceQuery,
    StepContext, StepState, Value,
};
use tracing::{debug, warn};

use crate::{PostsConfig, GROUP_MAP, SUPER_MODERATORS, SUPER_MODERATOR_GROUP};

const USER_LIMIT: usize = 500;
const THREAD_LIMIT: usize = 1_000;
const POST_LIMIT: usize = 200;

const POST_DATE_START: &str = "post_date_start";
const POST_ID_START: &str = "post_id_start";
const POST_POSITION: &str = "post_position";

/// Saves one record, turning record-level failures into a logged skip.
fn save_record<H: ImportHandler + ?Sized>(
    ctx: &mut StepContext<'_, '_>,
    state: &mut StepState,
    handler: &mut H,
    legacy_id: i64,
) -> ImportResult<Option<i64>> {
    match ctx.target.save(handler, Some(legacy_id)) {
        Ok(SaveOutcome::Inserted(new_id)) => {
            state.record_import();
            Ok(Some(new_id))
        }
        Ok(SaveOutcome::Existing(new_id)) => Ok(Some(new_id)),
        Ok(SaveOutcome::Skipped) => Ok(None),
        Err(err) if err.is_record_level() => {
            warn!(entity_type = handler.import_type(), legacy_id, error = %err, "skipping record");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Runs a handler setup closure, mapping record-level failures to `None`.
fn prepare<T>(
    entity_type: &str,
    legacy_id: i64,
    setup: impl FnOnce() -> ImportResult<T>,
) -> ImportResult<Option<T>> {
    match setup() {
        Ok(handler) => Ok(Some(handler)),
        Err(err) if err.is_record_level() => {
            warn!(entity_type, legacy_id, error = %err, "skipping record");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn visible_state(visible: i64) -> &'static str {
    match visible {
        0 => "moderated",
        2 => "deleted",
        _ => "visible",
    }
}

fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',').filter_map(|part| part.trim().parse::<i64>().ok()).filter(|id| *id > 0).collect()
}

pub(crate) fn user_groups(
    mut state: StepState,
    ctx: &mut StepContext<'_, '_>,
    bits: &PermissionBitMap,
) -> ImportResult<StepState> {
    let groups = ctx.source.fetch(&SourceQuery::new("legacy_usergroup", "usergroupid"))?;
    let fixed: BTreeMap<i64, i64> = GROUP_MAP.iter().copied().collect();

    for group in groups {
        let legacy_id = group.int("usergroupid");
        if let Some(target_group) = fixed.get(&legacy_id) {
            ctx.target.log_mapping("user_group", legacy_id, *target_group)?;
            continue;
        }

        let priority = if legacy_id == SUPER_MODERATOR_GROUP { 910 } else { 5 };
        let handler = prepare("user_group", legacy_id, || {
            let mut handler: UserGroupHandler = ctx.target.handler()?;
            let record = handler.record_mut();
            record.set("title", group.value("title"))?;
            record.set("user_title", group.value("usertitle"))?;
            record.set("display_style_priority", priority)?;
            handler.set_permissions(bits.apply(group.int("forumpermissions")));
            Ok(handler)
        })?;
        if let Some(mut handler) = handler {
            save_record(ctx, &mut state, &mut handler, legacy_id)?;
        }
    }

    Ok(state.complete())
}

pub(crate) fn users(mut state: StepState, ctx: &mut StepContext<'_, '_>) -> ImportResult<StepState> {
    let rows = ctx.source.fetch(
        &SourceQuery::new("legacy_user", "userid")
            .range(state.start_after(), state.end())
            .limit(ctx.limit(USER_LIMIT)),
    )?;
    if rows.is_empty() {
        return Ok(state.complete());
    }

    let legacy_groups = rows.iter().flat_map(|row| {
        let mut ids = parse_id_list(&row.text("membergroupids"));
        ids.push(row.int("usergroupid"));
        ids
    });
    let groups = ctx.target.lookup_batch("user_group", legacy_groups.collect::<Vec<_>>())?;
    debug!(rows = rows.len(), groups = groups.len(), "importing users");

    for row in rows {
        let legacy_id = row.int("userid");
        state.advance(legacy_id);

        let primary = row.int("usergroupid");
        let secondary = parse_id_list(&row.text("membergroupids"));
        let super_moderator =
            primary == SUPER_MODERATOR_GROUP || secondary.contains(&SUPER_MODERATOR_GROUP);
        let primary_group = groups.get(&primary).copied().unwrap_or(2);
        let secondary_groups: Vec<i64> = secondary
            .iter()
            .filter_map(|legacy| groups.get(legacy).copied())
            .filter(|group| *group != primary_group)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let all_groups: BTreeSet<i64> =
            secondary_groups.iter().copied().chain([primary_group]).collect();

        let handler = prepare("user", legacy_id, || {
            let mut handler: UserHandler = ctx.target.handler()?;
            let record = handler.record_mut();
            record.set("username", row.value("username"))?;
            record.set("email", row.value("email"))?;
            record.set("user_group_id", primary_group)?;
            record.set("secondary_group_ids", secondary_groups.clone())?;
            record.set("register_date", row.value("joindate"))?;
            record.set("last_activity", row.value("lastactivity"))?;
            record.set("message_count", row.value("posts"))?;
            record.set("custom_title", row.value("usertitle"))?;
            record.set("signature", row.value("signature"))?;
            record.set("is_admin", all_groups.contains(&3))?;
            record.set("is_moderator", super_moderator || all_groups.contains(&4))?;
            handler.set_register_ip(&row.text("ipaddress"));
            Ok(handler)
        })?;
        if let Some(mut handler) = handler {
            let new_id = save_record(ctx, &mut state, &mut handler, legacy_id)?;
            if let (Some(new_id), true) = (new_id, super_moderator) {
                ctx.context.insert_entry(SUPER_MODERATORS, &legacy_id.to_string(), new_id);
            }
        }

        if ctx.limit_exceeded() {
            break;
        }
    }

    Ok(state.resume_if_needed())
}

pub(crate) fn forums(mut state: StepState, ctx: &mut StepContext<'_, '_>) -> ImportResult<StepState> {
    let forums = ctx.source.fetch(
        &SourceQuery::new("legacy_forum", "forumid").order_by(&["displayorder", "forumid"]),
    )?;

    let mut children: BTreeMap<i64, Vec<Row>> = BTreeMap::new();
    for forum in forums {
        let parent = forum.int("parentid").max(0);
        children.entry(parent).or_default().push(forum);
    }

    import_forum_tree(&mut state, ctx, &mut children, 0, 0)?;

    let orphans: usize = children.values().map(Vec::len).sum();
    if orphans > 0 {
        warn!(orphans, "skipped forums whose parent was not imported");
    }
    // Forums saved by an earlier failed invocation come back as existing and queue nothing.
    ctx.target.defer(DeferredTask::RebuildNodeTree);
    Ok(state.complete())
}

fn import_forum_tree(
    state: &mut StepState,
    ctx: &mut StepContext<'_, '_>,
    children: &mut BTreeMap<i64, Vec<Row>>,
    legacy_parent: i64,
    parent_node: i64,
) -> ImportResult<()> {
    let Some(forums) = children.remove(&legacy_parent) else {
        return Ok(());
    };

    for forum in forums {
        let legacy_id = forum.int("forumid");
        let handler = prepare("node", legacy_id, || build_node(&*ctx, &forum, parent_node))?;
        let Some(mut handler) = handler else {
            continue;
        };
        if let Some(node_id) = save_record(ctx, state, &mut handler, legacy_id)? {
            import_forum_tree(state, ctx, children, legacy_id, node_id)?;
        }
    }
    Ok(())
}

fn build_node(ctx: &StepContext<'_, '_>, forum: &Row, parent_node: i64) -> ImportResult<NodeHandler> {
    let mut node: NodeHandler = ctx.target.handler()?;
    let record = node.record_mut();
    record.set("title", forum.value("title"))?;
    record.set("description", forum.value("description"))?;
    record.set("parent_node_id", parent_node)?;
    record.set("display_order", forum.value("displayorder"))?;

    match forum.text("forumtype").as_str() {
        "category" => node.set_type_data("Category", ctx.target.new_handler("category")?)?,
        "page" => {
            let mut page: PageHandler = ctx.target.handler()?;
            page.set_content(&forum.text("pagetext"));
            node.set_type_data("Page", Box::new(page))?;
        }
        _ => node.set_type_data("Forum", ctx.target.new_handler("forum")?)?,
    }
    Ok(node)
}

pub(crate) fn moderators(
    mut state: StepState,
    ctx: &mut StepContext<'_, '_>,
) -> ImportResult<StepState> {
    let super_moderators = ctx.context.entries(SUPER_MODERATORS);

    for (legacy, new_id) in super_moderators {
        let Ok(legacy_id) = legacy.parse::<i64>() else {
            warn!(entry = %legacy, "ignoring malformed super moderator entry");
            continue;
        };
        let Some(user_id) = new_id.as_i64() else {
            continue;
        };

        let handler = prepare("moderator", legacy_id, || {
            let mut handler = ctx.target.new_handler("moderator")?;
            handler.set("user_id", Value::Int(user_id))?;
            handler.set("is_super_moderator", Value::Bool(true))?;
            Ok(handler)
        })?;
        if let Some(mut handler) = handler {
            save_record(ctx, &mut state, handler.as_mut(), legacy_id)?;
        }
    }

    Ok(state.complete())
}

pub(crate) fn threads(mut state: StepState, ctx: &mut StepContext<'_, '_>) -> ImportResult<StepState> {
    let rows = ctx.source.fetch(
        &SourceQuery::new("legacy_thread", "threadid")
            .range(state.start_after(), state.end())
            .limit(ctx.limit(THREAD_LIMIT)),
    )?;
    if rows.is_empty() {
        return Ok(state.complete());
    }

    let nodes = ctx.target.lookup_batch("node", rows.iter().map(|row| row.int("forumid")))?;
    let users = ctx.target.lookup_batch("user", rows.iter().map(|row| row.int("postuserid")))?;

    for (handled, row) in rows.into_iter().enumerate() {
        if handled > 0 && ctx.limit_exceeded() {
            break;
        }
        let legacy_id = row.int("threadid");
        state.advance(legacy_id);

        if row.text("title").trim().is_empty() {
            debug!(legacy_id, "skipping thread without a title");
            continue;
        }
        let Some(node_id) = nodes.get(&row.int("forumid")).copied() else {
            debug!(legacy_id, forum = row.int("forumid"), "skipping thread in unmapped forum");
            continue;
        };

        let subscriptions = ctx.source.fetch(
            &SourceQuery::new("legacy_subscribethread", "subscribethreadid")
                .filter_eq("threadid", legacy_id),
        )?;
        let watchers = ctx
            .target
            .lookup_batch("user", subscriptions.iter().map(|row| row.int("userid")))?;

        let handler = prepare("thread", legacy_id, || {
            let mut handler: ThreadHandler = ctx.target.handler()?;
            let record = handler.record_mut();
            record.set("node_id", node_id)?;
            record.set("title", row.value("title"))?;
            record.set("user_id", users.get(&row.int("postuserid")).copied().unwrap_or(0))?;
            record.set("username", row.value("postusername"))?;
            record.set("post_date", row.value("dateline"))?;
            record.set("reply_count", row.value("replycount"))?;
            record.set("view_count", row.value("views"))?;
            record.set("sticky", row.int("sticky") != 0)?;
            record.set("discussion_open", row.int("open") != 0)?;
            record.set("discussion_state", visible_state(row.int("visible")))?;
            record.set("last_post_date", row.value("lastpost"))?;
            for subscription in &subscriptions {
                if let Some(user_id) = watchers.get(&subscription.int("userid")) {
                    handler.add_watcher(*user_id, subscription.int("emailupdate") > 0);
                }
            }
            Ok(handler)
        })?;
        if let Some(mut handler) = handler {
            save_record(ctx, &mut state, &mut handler, legacy_id)?;
        }
    }

    Ok(state.resume_if_needed())
}

/// Imports posts thread by thread.
///
/// Within a thread posts are read in `(dateline, postid)` order. When the budget runs out
/// mid-thread, the last key and the next position are kept in the state so the following
/// invocation continues inside the same thread.
pub(crate) fn posts(
    mut state: StepState,
    ctx: &mut StepContext<'_, '_>,
    config: &PostsConfig,
) -> ImportResult<StepState> {
    let threads = ctx.source.fetch(
        &SourceQuery::new("legacy_thread", "threadid")
            .range(state.start_after(), state.end())
            .limit(config.thread_limit.max(1)),
    )?;
    if threads.is_empty() {
        return Ok(state.complete());
    }

    let post_limit = config.limit.unwrap_or_else(|| ctx.limit(POST_LIMIT)).max(1);
    let mapped = ctx.target.lookup_batch("thread", threads.iter().map(|row| row.int("threadid")))?;

    'threads: for thread in threads {
        let legacy_thread = thread.int("threadid");
        let Some(thread_id) = mapped.get(&legacy_thread).copied() else {
            next_thread(&mut state, legacy_thread);
            if ctx.limit_exceeded() {
                break;
            }
            continue;
        };

        loop {
            let mut query = SourceQuery::new("legacy_post", "postid")
                .filter_eq("threadid", legacy_thread)
                .order_by(&["dateline", "postid"])
                .limit(post_limit);
            if let (Some(date), Some(post_id)) =
                (state.extra_i64(POST_DATE_START), state.extra_i64(POST_ID_START))
            {
                query = query.after(&["dateline", "postid"], vec![Value::Int(date), Value::Int(post_id)]);
            }
            let posts = ctx.source.fetch(&query)?;
            let page_size = posts.len();
            if posts.is_empty() {
                break;
            }

            let users = ctx.target.lookup_batch(
                "user",
                posts.iter().flat_map(|post| [post.int("userid"), post.int("edituserid")]),
            )?;

            for post in posts {
                let legacy_id = post.int("postid");
                state.set_extra(POST_DATE_START, post.int("dateline"));
                state.set_extra(POST_ID_START, legacy_id);

                let message = post.text("pagetext");
                if message.trim().is_empty() {
                    debug!(legacy_id, "skipping empty post");
                } else {
                    let position = state.extra_i64(POST_POSITION).unwrap_or(0);
                    let message_state = visible_state(post.int("visible"));
                    if message_state == "visible" {
                        state.set_extra(POST_POSITION, position + 1);
                    }
                    import_post(ctx, &mut state, &post, thread_id, position, message_state, &users)?;
                }

                if ctx.limit_exceeded() {
                    break 'threads;
                }
            }

            if page_size < post_limit {
                break;
            }
        }

        next_thread(&mut state, legacy_thread);
        if ctx.limit_exceeded() {
            break;
        }
    }

    Ok(state.resume_if_needed())
}

fn next_thread(state: &mut StepState, legacy_thread: i64) {
    state.advance(legacy_thread);
    state.clear_extra();
}

fn import_post(
    ctx: &mut StepContext<'_, '_>,
    state: &mut StepState,
    post: &Row,
    thread_id: i64,
    position: i64,
    message_state: &str,
    users: &BTreeMap<i64, i64>,
) -> ImportResult<()> {
    let legacy_id = post.int("postid");
    let edit_date = post.int("editdate");
    let username = match post.text("username") {
        name if name.trim().is_empty() => Value::from("Guest"),
        _ => post.value("username"),
    };

    let handler = prepare("post", legacy_id, || {
        let mut handler: PostHandler = ctx.target.handler()?;
        let record = handler.record_mut();
        record.set("thread_id", thread_id)?;
        record.set("user_id", users.get(&post.int("userid")).copied().unwrap_or(0))?;
        record.set("username", username)?;
        record.set("post_date", post.value("dateline"))?;
        record.set("message", post.value("pagetext"))?;
        record.set("message_state", message_state)?;
        record.set("position", position)?;
        record.set("last_edit_date", edit_date)?;
        record.set("last_edit_user_id", users.get(&post.int("edituserid")).copied().unwrap_or(0))?;
        record.set("edit_count", i64::from(edit_date > 0))?;
        handler.set_ip(&post.text("ipaddress"));
        Ok(handler)
    })?;
    if let Some(mut handler) = handler {
        save_record(ctx, state, &mut handler, legacy_id)?;
    }
    Ok(())
}
