//! 4chan-style JSON API source.
//!
//! Thread mode fetches `{base}/{board}/thread/{no}.json`; catalog mode pages
//! through `{base}/{board}/{page}.json` (the remote numbers pages from 1).
//! Use it as a template when adding another imageboard engine.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::DateTime;
use regex::Regex;
use serde::Deserialize;

use super::{FetchError, FetchFuture, FetchRequest, FetchResult, Post, ThreadSource};
use crate::errors::Result;
use crate::settings::SourceSettings;
use crate::target::LoadMode;

static QUOTE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&gt;&gt;(\d+)").expect("quote pattern is valid"));

#[derive(Debug, Deserialize)]
struct ThreadJson {
    posts: Vec<PostJson>,
}

#[derive(Debug, Deserialize)]
struct PageJson {
    threads: Vec<ThreadJson>,
}

#[derive(Debug, Deserialize)]
struct PostJson {
    no: u64,
    #[serde(default)]
    resto: u64,
    time: i64,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    com: Option<String>,
    #[serde(default)]
    closed: u8,
    #[serde(default)]
    archived: u8,
}

/// A 4chan-compatible read-only API source.
pub struct ChanSource {
    client: reqwest::Client,
    base_url: String,
    /// Post numbers the viewer authored; quoting one is a mention.
    saved_replies: Arc<HashSet<u64>>,
}

impl ChanSource {
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            saved_replies: Arc::new(settings.saved_replies.iter().copied().collect()),
        })
    }

    pub fn url_for(&self, request: &FetchRequest) -> String {
        let target = &request.target;
        match target.mode {
            LoadMode::Thread => format!("{}/{}/thread/{}.json", self.base_url, target.board, target.no),
            LoadMode::Catalog => format!("{}/{}/{}.json", self.base_url, target.board, request.page + 1),
        }
    }

    /// Parse a thread response body. Pure, so tests can skip the network.
    pub fn parse_thread(body: &[u8], saved: &HashSet<u64>) -> std::result::Result<Vec<Post>, FetchError> {
        let thread: ThreadJson =
            serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;
        thread.posts.into_iter().map(|p| convert(p, saved)).collect()
    }

    /// Parse one board index page, keeping only the opening posts.
    pub fn parse_page(body: &[u8], saved: &HashSet<u64>) -> std::result::Result<Vec<Post>, FetchError> {
        let page: PageJson =
            serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;
        page.threads
            .into_iter()
            .filter_map(|t| t.posts.into_iter().next())
            .map(|p| convert(p, saved))
            .collect()
    }
}

fn convert(raw: PostJson, saved: &HashSet<u64>) -> std::result::Result<Post, FetchError> {
    let time = DateTime::from_timestamp(raw.time, 0)
        .ok_or_else(|| FetchError::Decode(format!("post {} has invalid time {}", raw.no, raw.time)))?;

    let comment = raw.com.unwrap_or_default();
    let replies_to = quoted_posts(&comment);
    let mentions_viewer = replies_to.iter().any(|no| saved.contains(no));

    Ok(Post {
        no: raw.no,
        resto: raw.resto,
        time,
        subject: raw.sub,
        comment,
        replies_to,
        mentions_viewer,
        closed: raw.closed != 0,
        archived: raw.archived != 0,
    })
}

/// Post numbers quoted by `>>no` links in escaped comment markup.
fn quoted_posts(comment: &str) -> BTreeSet<u64> {
    QUOTE_LINK
        .captures_iter(comment)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

fn from_reqwest(e: reqwest::Error) -> FetchError {
    if let Some(status) = e.status() {
        FetchError::Status(status.as_u16())
    } else if e.is_decode() {
        FetchError::Decode(e.to_string())
    } else if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
        FetchError::Transport(e.to_string())
    } else {
        FetchError::Other(e.to_string())
    }
}

async fn fetch_body(client: &reqwest::Client, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await.map_err(from_reqwest)?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }
    let body = response.bytes().await.map_err(from_reqwest)?;
    Ok(body.to_vec())
}

impl ThreadSource for ChanSource {
    fn name(&self) -> &str {
        &self.base_url
    }

    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let client = self.client.clone();
        let saved = Arc::clone(&self.saved_replies);
        let url = self.url_for(&request);

        Box::pin(async move {
            tracing::debug!(%url, "fetching");
            let parsed = match fetch_body(&client, &url).await {
                Ok(body) => match request.target.mode {
                    LoadMode::Thread => ChanSource::parse_thread(&body, &saved),
                    LoadMode::Catalog => ChanSource::parse_page(&body, &saved),
                },
                Err(e) => Err(e),
            };

            match parsed {
                Ok(posts) => FetchResult::Success {
                    posts,
                    incremental: request.target.is_catalog() && request.page > 0,
                },
                Err(e) => e.into_result(&request),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::WatchTarget;

    const THREAD: &str = r##"{"posts":[
        {"no":100,"resto":0,"time":1704067200,"sub":"Thread","com":"OP text","closed":0},
        {"no":101,"resto":100,"time":1704067260,"com":"<a href=\"#p100\" class=\"quotelink\">&gt;&gt;100</a><br>agreed"},
        {"no":102,"resto":100,"time":1704067320,"com":"&gt;&gt;55 &gt;&gt;101"}
    ]}"##;

    fn settings() -> SourceSettings {
        SourceSettings {
            base_url: "https://a.example.org/".into(),
            user_agent: "test".into(),
            timeout_ms: 1000,
            saved_replies: vec![55],
        }
    }

    #[test]
    fn parse_thread_extracts_posts_and_quotes() {
        let posts = ChanSource::parse_thread(THREAD.as_bytes(), &HashSet::new()).unwrap();

        assert_eq!(posts.len(), 3);
        assert!(posts[0].is_op());
        assert_eq!(posts[0].subject.as_deref(), Some("Thread"));
        assert_eq!(posts[1].replies_to, BTreeSet::from([100]));
        assert_eq!(posts[2].replies_to, BTreeSet::from([55, 101]));
        assert!(posts.iter().all(|p| !p.mentions_viewer));
    }

    #[test]
    fn quoting_a_saved_reply_is_a_mention() {
        let saved = HashSet::from([55]);
        let posts = ChanSource::parse_thread(THREAD.as_bytes(), &saved).unwrap();

        assert!(!posts[1].mentions_viewer);
        assert!(posts[2].mentions_viewer);
    }

    #[test]
    fn cross_board_links_are_not_quotes() {
        assert!(quoted_posts("&gt;&gt;&gt;/g/123").is_empty());
    }

    #[test]
    fn archived_flag_is_read() {
        let body = r#"{"posts":[{"no":1,"resto":0,"time":1704067200,"archived":1}]}"#;
        let posts = ChanSource::parse_thread(body.as_bytes(), &HashSet::new()).unwrap();
        assert!(posts[0].archived);
        assert!(!posts[0].closed);
    }

    #[test]
    fn invalid_body_is_a_decode_error() {
        let err = ChanSource::parse_thread(b"<html>", &HashSet::new()).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn parse_page_keeps_opening_posts_only() {
        let body = r#"{"threads":[
            {"posts":[{"no":1,"resto":0,"time":1704067200},{"no":5,"resto":1,"time":1704067300}]},
            {"posts":[{"no":2,"resto":0,"time":1704067200}]}
        ]}"#;
        let posts = ChanSource::parse_page(body.as_bytes(), &HashSet::new()).unwrap();
        let nos: Vec<u64> = posts.iter().map(|p| p.no).collect();
        assert_eq!(nos, vec![1, 2]);
    }

    #[test]
    fn urls_for_thread_and_catalog_pages() {
        let source = ChanSource::new(&settings()).unwrap();

        let thread = FetchRequest {
            target: WatchTarget::thread("g", 100),
            page: 0,
            known: Arc::new(Vec::new()),
        };
        assert_eq!(source.url_for(&thread), "https://a.example.org/g/thread/100.json");

        let page = FetchRequest {
            target: WatchTarget::catalog("g"),
            page: 2,
            known: Arc::new(Vec::new()),
        };
        assert_eq!(source.url_for(&page), "https://a.example.org/g/3.json");
    }
}
