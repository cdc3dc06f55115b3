//! Console commands read from stdin.
//!
//! Parsing is separate from execution so both can be tested without a
//! terminal. Execution returns the text to print.

use catalog_core::store::{EntryStore, StatsStore};
use catalog_core::{ContentEntry, ContentId, Node, UpsertOutcome, time};
use std::fmt::Write;
use thiserror::Error;

pub const HELP: &str = "\
Commands:
  add <locator> <descriptor> [title...]  Publish an entry
  search <text or locator>               Search locally and ask peers
  peers                                  List open sessions
  presence                               List known identities
  stats <content-id>                     Show counters and holders
  help                                   Show this help";

const ADD_USAGE: &str = "add <locator> <descriptor> [title...]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add {
        locator: String,
        descriptor: String,
        title: Option<String>,
    },
    Search(String),
    Peers,
    Presence,
    Stats(ContentId),
    Help,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0} (try `help`)")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
}

/// Parse one console line. Blank lines parse to `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    let Some((name, rest)) = split_word(line) else {
        return Ok(None);
    };

    let command = match name.to_ascii_lowercase().as_str() {
        "add" => {
            let (locator, rest) = split_word(rest).ok_or(CommandError::Usage(ADD_USAGE))?;
            let (descriptor, title) = split_word(rest).ok_or(CommandError::Usage(ADD_USAGE))?;
            Command::Add {
                locator: locator.to_string(),
                descriptor: descriptor.to_string(),
                title: (!title.is_empty()).then(|| title.to_string()),
            }
        }
        "search" => {
            if rest.is_empty() {
                return Err(CommandError::Usage("search <text or locator>"));
            }
            Command::Search(rest.to_string())
        }
        "stats" => {
            if rest.is_empty() {
                return Err(CommandError::Usage("stats <content-id>"));
            }
            Command::Stats(ContentId::new(rest))
        }
        "peers" => Command::Peers,
        "presence" => Command::Presence,
        "help" | "?" => Command::Help,
        _ => return Err(CommandError::Unknown(name.to_string())),
    };
    Ok(Some(command))
}

/// First whitespace-separated word and the trimmed remainder.
fn split_word(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest.trim())),
        None => Some((text, "")),
    }
}

/// What running a command produced.
#[derive(Debug, Default)]
pub struct Output {
    pub text: String,
    /// Content to request from holders once the query grace period passes.
    pub follow_up: Option<ContentId>,
}

impl Output {
    fn text(text: String) -> Self {
        Self {
            text,
            follow_up: None,
        }
    }
}

pub async fn execute<S>(node: &mut Node<S>, command: Command) -> Output
where
    S: EntryStore + StatsStore,
{
    match command {
        Command::Add {
            locator,
            descriptor,
            title,
        } => Output::text(add(node, locator, descriptor, title).await),
        Command::Search(query) => search(node, &query).await,
        Command::Peers => Output::text(peers(node)),
        Command::Presence => Output::text(presence(node)),
        Command::Stats(content_id) => Output::text(stats(node, &content_id).await),
        Command::Help => Output::text(HELP.to_string()),
    }
}

async fn add<S: EntryStore + StatsStore>(
    node: &mut Node<S>,
    locator: String,
    descriptor: String,
    title: Option<String>,
) -> String {
    let mut entry = ContentEntry::new(locator, descriptor, node.identity(), time::now_ms());
    if let Some(title) = title {
        entry = entry.with_title(title);
    }
    let content_id = entry.content_id();
    let locator = entry.source_locator.clone();

    match node.publish(entry).await {
        Ok(UpsertOutcome::Stale) => format!("A newer version of {} is already stored", locator),
        Ok(_) => format!("Published {} as {}", locator, content_id),
        Err(e) => format!("Failed to publish {}: {}", locator, e),
    }
}

async fn search<S: EntryStore + StatsStore>(node: &mut Node<S>, query: &str) -> Output {
    let results = match node.search(query).await {
        Ok(results) => results,
        Err(e) => return Output::text(format!("Search failed: {}", e)),
    };

    let mut text = String::new();
    if results.entries.is_empty() {
        let _ = write!(text, "No local entries for {}", results.content_id);
    } else {
        let _ = write!(
            text,
            "{} local entries for {}:",
            results.entries.len(),
            results.content_id
        );
        for entry in &results.entries {
            let _ = write!(
                text,
                "\n  {} <{}> by {} [{}]",
                entry.title, entry.source_locator, entry.author, entry.descriptor
            );
        }
    }
    if node.registry().open_count() > 0 {
        text.push_str("\nAsking peers...");
    }

    Output {
        text,
        follow_up: Some(results.content_id),
    }
}

fn peers<S: EntryStore + StatsStore>(node: &Node<S>) -> String {
    let mut sessions: Vec<_> = node.registry().sessions().filter(|s| s.is_open()).collect();
    if sessions.is_empty() {
        return "No peers connected".to_string();
    }
    sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    let mut text = format!("{} peers connected:", sessions.len());
    for session in sessions {
        let _ = write!(
            text,
            "\n  {} ({}) {:?} via {}",
            session.identity.as_deref().unwrap_or("?"),
            session.peer_id.map(|p| p.short()).unwrap_or_default(),
            session.direction,
            session.session_id
        );
    }
    text
}

fn presence<S: EntryStore + StatsStore>(node: &Node<S>) -> String {
    let now = time::now_ms();
    let mut text = String::from("Presence:");
    for record in node.presence().records() {
        let last_seen = node
            .presence()
            .get_last_seen(&record.identity, now)
            .map(|l| l.to_string())
            .unwrap_or_default();
        let me = if record.identity == node.identity() {
            " (you)"
        } else {
            ""
        };
        let _ = write!(text, "\n  {}{}: {}", record.identity, me, last_seen);
    }
    text
}

async fn stats<S: EntryStore + StatsStore>(node: &Node<S>, content_id: &ContentId) -> String {
    let counters = match node.stats(content_id).await {
        Ok(stats) => stats,
        Err(e) => return format!("Failed to read stats for {}: {}", content_id, e),
    };
    let holders = node.find_peers(content_id);
    let index = node.index().stats();
    format!(
        "{}: {} searches, {} downloads, {} holders\nIndex: {} content IDs, {} announced by us, {} peers",
        content_id,
        counters.searches,
        counters.downloads,
        holders.len(),
        index.total_content,
        index.my_content,
        index.total_peers
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{InMemoryStore, NodeConfig, PeerId};
    use std::sync::Arc;

    const LOCATOR: &str = "https://forum.example/t/forum-post-123";

    fn node() -> Node<InMemoryStore> {
        let config = NodeConfig::new("swift-otter").with_peer_id(PeerId::from(1));
        Node::new(config, Arc::new(InMemoryStore::new()))
    }

    // ==================== Parsing ====================

    #[test]
    fn test_parse_add() {
        assert_eq!(
            parse(&format!("add {LOCATOR} magnet:?xt=abc  Forum Post  123 ")).unwrap(),
            Some(Command::Add {
                locator: LOCATOR.into(),
                descriptor: "magnet:?xt=abc".into(),
                title: Some("Forum Post  123".into()),
            })
        );
        assert_eq!(
            parse(&format!("add {LOCATOR} d1")).unwrap(),
            Some(Command::Add {
                locator: LOCATOR.into(),
                descriptor: "d1".into(),
                title: None,
            })
        );
    }

    #[test]
    fn test_parse_other_commands() {
        assert_eq!(
            parse("search forum post").unwrap(),
            Some(Command::Search("forum post".into()))
        );
        assert_eq!(
            parse("stats forum-post-123").unwrap(),
            Some(Command::Stats(ContentId::new("forum-post-123")))
        );
        assert_eq!(parse("PEERS").unwrap(), Some(Command::Peers));
        assert_eq!(parse("presence").unwrap(), Some(Command::Presence));
        assert_eq!(parse("help").unwrap(), Some(Command::Help));
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("add"), Err(CommandError::Usage(_))));
        assert!(matches!(parse(&format!("add {LOCATOR}")), Err(CommandError::Usage(_))));
        assert!(matches!(parse("search"), Err(CommandError::Usage(_))));
        assert!(matches!(parse("stats "), Err(CommandError::Usage(_))));
        assert_eq!(
            parse("download x"),
            Err(CommandError::Unknown("download".into()))
        );
    }

    // ==================== Execution ====================

    #[tokio::test]
    async fn test_add_then_search() {
        let mut node = node();

        let added = execute(
            &mut node,
            Command::Add {
                locator: LOCATOR.into(),
                descriptor: "d1".into(),
                title: None,
            },
        )
        .await;
        assert_eq!(added.text, format!("Published {LOCATOR} as forum-post-123"));
        assert!(added.follow_up.is_none());

        let stored = node.store().get(LOCATOR).await.unwrap().unwrap();
        assert_eq!(stored.author, "swift-otter");
        assert_eq!(stored.title, "Forum Post 123");

        let found = execute(&mut node, Command::Search("forum post".into())).await;
        assert!(found.text.starts_with("1 local entries for forum-post"));
        assert!(found.text.contains("Forum Post 123"));
        assert_eq!(found.follow_up, Some(ContentId::new("forum-post")));
    }

    #[tokio::test]
    async fn test_add_older_version_is_reported_stale() {
        let mut node = node();
        node.store()
            .put(ContentEntry::new(LOCATOR, "d2", "someone", u64::MAX))
            .await
            .unwrap();

        let out = execute(
            &mut node,
            Command::Add {
                locator: LOCATOR.into(),
                descriptor: "d1".into(),
                title: Some("Mine".into()),
            },
        )
        .await;
        assert_eq!(out.text, format!("A newer version of {LOCATOR} is already stored"));
    }

    #[tokio::test]
    async fn test_search_miss() {
        let mut node = node();
        let out = execute(&mut node, Command::Search("nothing here".into())).await;
        assert_eq!(out.text, "No local entries for nothing-here");
        assert_eq!(out.follow_up, Some(ContentId::new("nothing-here")));
    }

    #[tokio::test]
    async fn test_listings_without_peers() {
        let mut node = node();
        assert_eq!(execute(&mut node, Command::Peers).await.text, "No peers connected");
        assert_eq!(
            execute(&mut node, Command::Presence).await.text,
            "Presence:\n  swift-otter (you): Online now"
        );
        assert_eq!(execute(&mut node, Command::Help).await.text, HELP);
    }

    #[tokio::test]
    async fn test_stats_counts_searches() {
        let mut node = node();
        execute(&mut node, Command::Search("forum post".into())).await;
        execute(&mut node, Command::Search("forum post".into())).await;

        let out = execute(&mut node, Command::Stats(ContentId::new("forum-post"))).await;
        assert!(out.text.starts_with("forum-post: 2 searches, 0 downloads, 0 holders"));
    }
}
