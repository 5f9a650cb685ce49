use crate::backend::ChatMessage;

pub const TOPIC_PROMPT_VERSION: &str = "topic.v1";
pub const CATEGORY_PROMPT_VERSION: &str = "category.v1";

pub const TOPIC_SUMMARY_TEMPLATE: &str = "Create a concise topic description about the current conversation. \
Use as few words as possible, ideally 2 or 3 words. \
This should be concise like a bullet point in presentiation, but should contain no symbols. \
Only crete a new topic summary if there is not an obvious match with a previous summary here: {topics}. \
If this is about code, include the language, framework that is discussed, or both.";

pub const CATEGORY_SUMMARY_TEMPLATE: &str = "This is my topic: {summary}. \
Create a new generalized category of no more than 2 words describing the topic. \
If this is a programming langage only return the language name. \
This should be concise like a bullet point in presentiation. Do not include any symobls. \
If the similarity between your summary and one of the items in the list here: {categories} \
is 25% or higher, output only the item in the list, otherwise output the summary you just created. \
Do not explain, only output 1 to 2 word category description.";

pub const CATEGORY_EDITOR_CONTEXT: &str = "You are a publishing editor who creates tables of contents";

pub fn build_topic_summary_request<S: AsRef<str>>(existing_topics: &[S]) -> ChatMessage {
    ChatMessage::user(fill(
        TOPIC_SUMMARY_TEMPLATE,
        &[("topics", &render_item_list(existing_topics))],
    ))
}

pub fn build_category_summary_request<S: AsRef<str>>(
    topic_summary: &str,
    existing_categories: &[S],
) -> ChatMessage {
    ChatMessage::user(fill(
        CATEGORY_SUMMARY_TEMPLATE,
        &[
            ("summary", topic_summary),
            ("categories", &render_item_list(existing_categories)),
        ],
    ))
}

pub fn render_item_list<S: AsRef<str>>(items: &[S]) -> String {
    let quoted = items
        .iter()
        .map(|item| quote_item(item.as_ref()))
        .collect::<Vec<_>>();
    format!("[{}]", quoted.join(", "))
}

fn quote_item(item: &str) -> String {
    if item.contains('\'') && !item.contains('"') {
        format!("\"{item}\"")
    } else {
        format!("'{}'", item.replace('\'', "\\'"))
    }
}

// Slots are filled in one pass so a value containing `{...}` is never re-expanded.
fn fill(template: &str, slots: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let replaced = after.find('}').and_then(|end| {
            let name = &after[..end];
            slots
                .iter()
                .find(|(slot, _)| *slot == name)
                .map(|(_, value)| (end, *value))
        });

        match replaced {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
