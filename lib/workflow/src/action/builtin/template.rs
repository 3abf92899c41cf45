//! `{{field}}` placeholders in handler text.

use crate::action::ExecutionContext;
use serde_json::Value as JsonValue;

/// Looks up a dotted path such as `location.site` or `items.0.sku`.
pub(crate) fn field_value<'a>(data: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(data, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Replaces `{{path}}` placeholders with values from the triggering record.
///
/// `entity_id`, `entity_name`, `entity_type` and `rule_name` resolve from the
/// context when the record has no such field. Unknown placeholders render
/// empty.
pub(crate) fn render(template: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        out.push_str(&resolve(path, ctx));
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

fn resolve(path: &str, ctx: &ExecutionContext) -> String {
    if let Some(value) = field_value(&ctx.raw_data, path) {
        return match value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Null => String::new(),
            other => other.to_string(),
        };
    }
    match path {
        "entity_id" => ctx.entity_id.clone(),
        "entity_name" => ctx.entity_name.clone().unwrap_or_default(),
        "entity_type" => ctx.entity_type.clone(),
        "rule_name" => ctx.rule_name.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::tests::context;
    use serde_json::json;

    #[test]
    fn field_value_walks_objects_and_arrays() {
        let data = json!({ "location": { "site": "North" }, "items": [{ "sku": "A1" }] });
        assert_eq!(field_value(&data, "location.site"), Some(&json!("North")));
        assert_eq!(field_value(&data, "items.0.sku"), Some(&json!("A1")));
        assert_eq!(field_value(&data, "items.3.sku"), None);
        assert_eq!(field_value(&data, "missing"), None);
    }

    #[test]
    fn render_substitutes_fields_and_context() {
        let ctx = context(json!({ "score": 2, "location": { "site": "North" } }));
        let text = render(
            "{{ entity_name }} at {{location.site}} scored {{score}}{{unknown}}",
            &ctx,
        );
        assert_eq!(text, "Pump 42 at North scored 2");
    }

    #[test]
    fn render_keeps_unterminated_placeholder() {
        let ctx = context(json!({}));
        assert_eq!(render("value {{oops", &ctx), "value {{oops");
    }
}
