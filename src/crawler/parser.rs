//! Feed item parser
//!
//! This module turns raw feed items into storage records:
//! - Search hits into discovery results
//! - Question payloads into parent entities
//! - Answer and comment payloads into child entities
//!
//! Items may arrive bare or wrapped in `{"object": ...}` (search) or
//! `{"target_type": ..., "target": ...}` (feeds). Items without a usable
//! id are dropped.

use crate::storage::{ChildEntity, ChildKind, DiscoveryResult, ParentEntity};
use serde_json::Value;

const PARENT_ID_PLACEHOLDER: &str = "{parent_id}";

/// Strips a feed wrapper, returning the payload
fn unwrap_item(item: &Value) -> &Value {
    item.get("object")
        .or_else(|| item.get("target"))
        .filter(|v| v.is_object())
        .unwrap_or(item)
}

/// Reads an id that may be encoded as a string or a number
fn id_of(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn count_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

fn author_name(value: &Value) -> Option<String> {
    value.get("author").and_then(|a| str_field(a, "name"))
}

/// Removes markup such as search highlight tags
pub fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Builds the public page URL of a parent from the configured template
pub fn parent_url(template: &str, parent_id: &str) -> String {
    template.replace(PARENT_ID_PLACEHOLDER, parent_id)
}

/// Parses one search hit into a discovery result
///
/// A hit is either a question itself or an answer carrying its question; in
/// the second case the question is what gets discovered.
///
/// # Arguments
///
/// * `item` - Raw feed item
/// * `task_id` - Owning task
/// * `url_template` - Parent page URL template containing `{parent_id}`
///
/// # Returns
///
/// * `Some(DiscoveryResult)` - The referenced parent
/// * `None` - The item does not reference a parent
pub fn parse_discovery_item(
    item: &Value,
    task_id: &str,
    url_template: &str,
) -> Option<DiscoveryResult> {
    let payload = unwrap_item(item);
    let is_question = payload.get("type").and_then(Value::as_str) == Some("question");

    let (question, preview) = if is_question {
        (payload, str_field(payload, "excerpt"))
    } else {
        (payload.get("question")?, str_field(payload, "excerpt"))
    };

    let natural_id = id_of(question)?;
    let title = str_field(question, "title")
        .or_else(|| str_field(question, "name"))
        .map(|t| strip_tags(&t))
        .unwrap_or_default();

    Some(DiscoveryResult {
        url: parent_url(url_template, &natural_id),
        natural_id,
        task_id: task_id.to_string(),
        title,
        preview: preview.map(|p| strip_tags(&p)),
        author: author_name(question).or_else(|| author_name(payload)),
        answer_count: count_field(question, "answer_count"),
        processed: false,
    })
}

/// Builds the parent entity for a discovered question
///
/// `details`, when present, is a question payload (for example the
/// `question` object embedded in a child feed item) whose fields take
/// precedence over what discovery recorded.
pub fn parse_parent(discovery: &DiscoveryResult, details: Option<&Value>) -> ParentEntity {
    let mut parent = ParentEntity {
        natural_id: discovery.natural_id.clone(),
        task_id: discovery.task_id.clone(),
        title: discovery.title.clone(),
        content: discovery.preview.clone().unwrap_or_default(),
        author: discovery.author.clone(),
        url: discovery.url.clone(),
        follower_count: 0,
        view_count: 0,
        answer_count: discovery.answer_count.unwrap_or(0),
        tags: Vec::new(),
        processed: false,
    };

    let Some(details) = details.map(unwrap_item) else {
        return parent;
    };
    if id_of(details).is_some_and(|id| id != parent.natural_id) {
        tracing::debug!(
            parent_id = %parent.natural_id,
            "Ignoring question details for a different parent"
        );
        return parent;
    }

    if let Some(title) = str_field(details, "title").or_else(|| str_field(details, "name")) {
        parent.title = strip_tags(&title);
    }
    if let Some(detail) = str_field(details, "detail") {
        parent.content = detail;
    }
    if let Some(author) = author_name(details) {
        parent.author = Some(author);
    }
    parent.follower_count = count_field(details, "follower_count").unwrap_or(parent.follower_count);
    parent.view_count = count_field(details, "visit_count").unwrap_or(parent.view_count);
    parent.answer_count = count_field(details, "answer_count").unwrap_or(parent.answer_count);

    if let Some(topics) = details.get("topics").and_then(Value::as_array) {
        parent.tags = topics
            .iter()
            .filter_map(|t| str_field(t, "name"))
            .collect();
    }

    parent
}

/// Parses one child feed item
///
/// # Arguments
///
/// * `item` - Raw feed item
/// * `task_id` - Owning task
/// * `parent_id` - Parent whose feed is being walked
/// * `url_template` - Parent page URL template containing `{parent_id}`
///
/// # Returns
///
/// * `Some(ChildEntity)` - Parsed answer or comment
/// * `None` - The item has no id
pub fn parse_child_item(
    item: &Value,
    task_id: &str,
    parent_id: &str,
    url_template: &str,
) -> Option<ChildEntity> {
    let payload = unwrap_item(item);
    let natural_id = id_of(payload)?;

    let kind = match payload
        .get("type")
        .or_else(|| item.get("target_type"))
        .and_then(Value::as_str)
    {
        Some("comment") => ChildKind::Comment,
        _ => ChildKind::Answer,
    };

    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut child = ChildEntity::new(natural_id, task_id, parent_id, kind, content);
    child.author = author_name(payload);
    child.url = format!(
        "{}/answer/{}",
        parent_url(url_template, parent_id),
        child.natural_id
    );
    child.vote_count = count_field(payload, "voteup_count")
        .or_else(|| count_field(payload, "vote_count"))
        .unwrap_or(0);
    child.comment_count = count_field(payload, "comment_count").unwrap_or(0);
    child.source_created_at = payload
        .get("created_time")
        .and_then(Value::as_i64)
        .filter(|t| *t > 0);
    child.source_updated_at = payload
        .get("updated_time")
        .and_then(Value::as_i64)
        .filter(|t| *t > 0);

    Some(child)
}

/// Returns the question payload embedded in a child feed item, if any
pub fn embedded_question(item: &Value) -> Option<&Value> {
    unwrap_item(item).get("question").filter(|q| q.is_object())
}
