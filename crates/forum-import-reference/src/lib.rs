//! The `reference` importer: a complete step set over a small, documented legacy layout.
//!
//! Legacy tables read by each step:
//!
//! | Table | Columns |
//! |---|---|
//! | `legacy_usergroup` | `usergroupid`, `title`, `usertitle`, `forumpermissions` |
//! | `legacy_user` | `userid`, `username`, `email`, `usergroupid`, `membergroupids` (comma list), `joindate`, `lastactivity`, `posts`, `usertitle`, `signature`, `ipaddress` |
//! | `legacy_forum` | `forumid`, `parentid` (`0` or `-1` for roots), `title`, `description`, `displayorder`, `forumtype` (`category`, `forum`, `page`), `pagetext` |
//! | `legacy_thread` | `threadid`, `forumid`, `title`, `postuserid`, `postusername`, `dateline`, `replycount`, `views`, `sticky`, `open`, `visible`, `lastpost` |
//! | `legacy_subscribethread` | `subscribethreadid`, `userid`, `threadid`, `emailupdate` |
//! | `legacy_post` | `postid`, `threadid`, `userid`, `username`, `pagetext`, `dateline`, `visible`, `ipaddress`, `editdate`, `edituserid` |
//!
//! `visible` is `1` for visible content, `0` for moderated and `2` for deleted.

mod steps;

use forum_import_core::permissions::PermissionBitMap;
use forum_import_core::{
    ImportError, ImportResult, Importer, ImporterRegistry, SessionOptions, SourceRows,
    StepContext, StepDefinition, StepState,
};
use serde::Deserialize;

pub const KEY: &str = "reference";

pub const STEP_USER_GROUPS: &str = "user_groups";
pub const STEP_USERS: &str = "users";
pub const STEP_FORUMS: &str = "forums";
pub const STEP_MODERATORS: &str = "moderators";
pub const STEP_THREADS: &str = "threads";
pub const STEP_POSTS: &str = "posts";

/// Legacy groups folded into the target's built-in groups instead of being imported.
pub const GROUP_MAP: &[(i64, i64)] = &[(1, 1), (2, 2), (3, 2), (4, 2), (6, 3), (7, 4)];

/// Legacy group whose members become super moderators.
pub const SUPER_MODERATOR_GROUP: i64 = 5;

/// Session context key holding `legacy user id -> target user id` for super moderators.
pub const SUPER_MODERATORS: &str = "super_moderators";

/// Configuration accepted under `step_config.user_groups`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserGroupsConfig {
    /// Replaces the built-in forum permission layout.
    pub permission_bits: Option<PermissionBitMap>,
}

/// Configuration accepted under `step_config.posts`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostsConfig {
    /// Posts fetched per query.
    pub limit: Option<usize>,
    /// Threads visited per invocation.
    pub thread_limit: usize,
}

impl Default for PostsConfig {
    fn default() -> Self {
        Self { limit: None, thread_limit: 50 }
    }
}

/// Forum permission bits of the legacy layout.
#[must_use]
pub fn default_permission_bits() -> PermissionBitMap {
    PermissionBitMap::new()
        .with(0, "general", "view")
        .with(0, "general", "viewNode")
        .with(1, "forum", "viewOthers")
        .with(2, "general", "search")
        .with(4, "forum", "postThread")
        .with(5, "forum", "postReply")
        .with(7, "forum", "editOwnPost")
        .with(8, "forum", "deleteOwnPost")
        .with(9, "forum", "deleteOwnThread")
        .with(12, "forum", "viewAttachment")
        .with(13, "forum", "uploadAttachment")
        .with(15, "forum", "votePoll")
        .with(19, "forum", "viewContent")
}

#[derive(Debug, Default)]
pub struct ReferenceImporter;

impl ReferenceImporter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn boxed() -> Box<dyn Importer> {
        Box::new(Self)
    }
}

/// Adds the reference importer to `registry` under [`KEY`].
///
/// # Errors
/// Returns `ImportError::Configuration` when the key is already registered.
pub fn register(registry: &mut ImporterRegistry) -> ImportResult<()> {
    registry.register(KEY, ReferenceImporter::boxed)
}

impl Importer for ReferenceImporter {
    fn key(&self) -> &'static str {
        KEY
    }

    fn title(&self) -> &'static str {
        "Reference legacy forum"
    }

    fn steps(&self) -> Vec<StepDefinition> {
        vec![
            StepDefinition::new(STEP_USER_GROUPS, "User groups"),
            StepDefinition::new(STEP_USERS, "Users").depends_on(&[STEP_USER_GROUPS]).batched(),
            StepDefinition::new(STEP_FORUMS, "Forums").depends_on(&[STEP_USER_GROUPS]),
            StepDefinition::new(STEP_MODERATORS, "Moderators")
                .depends_on(&[STEP_USERS, STEP_FORUMS]),
            StepDefinition::new(STEP_THREADS, "Threads")
                .depends_on(&[STEP_FORUMS])
                .forces(&[STEP_POSTS])
                .batched(),
            StepDefinition::new(STEP_POSTS, "Posts").depends_on(&[STEP_THREADS]).batched(),
        ]
    }

    fn validate_options(&self, options: &SessionOptions) -> ImportResult<()> {
        if let Some(config) = options.step_config.get(STEP_USER_GROUPS) {
            parse_config::<UserGroupsConfig>(STEP_USER_GROUPS, config)?;
        }
        if let Some(config) = options.step_config.get(STEP_POSTS) {
            let posts = parse_config::<PostsConfig>(STEP_POSTS, config)?;
            if posts.thread_limit == 0 {
                return Err(ImportError::Configuration(
                    "posts.thread_limit must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn step_end(&self, step: &str, source: &dyn SourceRows) -> ImportResult<i64> {
        match step {
            STEP_USERS => source.max_key("legacy_user", "userid"),
            STEP_THREADS | STEP_POSTS => source.max_key("legacy_thread", "threadid"),
            _ => Ok(0),
        }
    }

    fn run_step(
        &mut self,
        step: &str,
        state: StepState,
        ctx: &mut StepContext<'_, '_>,
    ) -> ImportResult<StepState> {
        match step {
            STEP_USER_GROUPS => {
                let config = parse_config::<UserGroupsConfig>(step, ctx.config)?;
                let bits = config.permission_bits.unwrap_or_else(default_permission_bits);
                steps::user_groups(state, ctx, &bits)
            }
            STEP_USERS => steps::users(state, ctx),
            STEP_FORUMS => steps::forums(state, ctx),
            STEP_MODERATORS => steps::moderators(state, ctx),
            STEP_THREADS => steps::threads(state, ctx),
            STEP_POSTS => {
                let config = parse_config::<PostsConfig>(step, ctx.config)?;
                steps::posts(state, ctx, &config)
            }
            other => Err(ImportError::Configuration(format!("reference importer has no step `{other}`"))),
        }
    }
}

fn parse_config<T>(step: &str, config: &serde_json::Value) -> ImportResult<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|err| ImportError::Configuration(format!("invalid config for step `{step}`: {err}")))
}

#[cfg(test)]
mod tests {
    use forum_import_core::StepGraph;

    use super::*;

    #[test]
    fn steps_form_a_graph_with_posts_last() -> ImportResult<()> {
        let graph = StepGraph::new(ReferenceImporter::new().steps())?;
        assert_eq!(
            graph.order(),
            [STEP_USER_GROUPS, STEP_USERS, STEP_FORUMS, STEP_MODERATORS, STEP_THREADS, STEP_POSTS]
        );
        assert_eq!(graph.forced_by(STEP_THREADS), [STEP_POSTS.to_string()]);
        Ok(())
    }

    #[test]
    fn invalid_step_config_is_rejected_up_front() {
        let importer = ReferenceImporter::new();
        let mut options = SessionOptions::default();
        options.step_config.insert(STEP_POSTS.to_string(), serde_json::json!({ "thread_limit": 0 }));
        assert!(matches!(importer.validate_options(&options), Err(ImportError::Configuration(_))));

        options.step_config.insert(STEP_POSTS.to_string(), serde_json::json!({ "threads": 5 }));
        assert!(matches!(importer.validate_options(&options), Err(ImportError::Configuration(_))));

        options.step_config.insert(STEP_POSTS.to_string(), serde_json::json!({ "thread_limit": 5 }));
        assert!(importer.validate_options(&options).is_ok());
    }

    #[test]
    fn registration_is_by_key() -> ImportResult<()> {
        let mut registry = ImporterRegistry::new();
        register(&mut registry)?;
        assert_eq!(registry.create(KEY)?.key(), KEY);
        assert!(register(&mut registry).is_err());
        Ok(())
    }

    #[test]
    fn default_permission_bits_use_single_bit_tests() {
        let set = default_permission_bits().apply(0b10_0001);
        assert_eq!(
            set.get("general", "view"),
            Some(forum_import_core::permissions::PermissionValue::Allow)
        );
        assert_eq!(
            set.get("forum", "postReply"),
            Some(forum_import_core::permissions::PermissionValue::Allow)
        );
        assert_eq!(
            set.get("general", "search"),
            Some(forum_import_core::permissions::PermissionValue::Unset)
        );
    }
}
