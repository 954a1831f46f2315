// QuectoFlow — Placeholder resolution
//
// `${initial_context.<key>}` inside any string of a workflow document is
// replaced with the string form of that key in the caller's initial inputs.
// Resolution happens once, before the first step runs; it is a load-time
// template pass, not a runtime variable system.

use super::context::Context;
use super::error::WorkflowError;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*initial_context\.([^}\s]+)\s*\}").expect("valid placeholder pattern")
});

/// String form of a context value: strings verbatim, everything else as JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Look up `path` as a key of `ctx`, or else `a.b.c` as `ctx["a"]["b"]["c"]`.
fn lookup<'a>(ctx: &'a Context, path: &str) -> Option<&'a Value> {
    if let Some(value) = ctx.get(path) {
        return Some(value);
    }
    let mut segments = path.split('.');
    let mut current = ctx.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn resolve_str(text: &str, ctx: &Context) -> Result<String, WorkflowError> {
    let mut missing = None;
    let replaced = PATTERN.replace_all(text, |caps: &Captures| {
        let key = &caps[1];
        match lookup(ctx, key) {
            Some(value) => render(value),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(WorkflowError::MissingPlaceholder { key }),
        None => Ok(replaced.into_owned()),
    }
}

fn resolve_value(value: &Value, ctx: &Context) -> Result<Value, WorkflowError> {
    Ok(match value {
        Value::String(s) => Value::String(resolve_str(s, ctx)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, ctx)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Return a copy of `doc` with every placeholder substituted from `ctx`.
///
/// Fails with [`WorkflowError::MissingPlaceholder`] on the first reference
/// to a key that `ctx` does not define; nothing partially resolved escapes.
pub fn resolve(doc: &Value, ctx: &Context) -> Result<Value, WorkflowError> {
    resolve_value(doc, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        Context::from_value(json!({
            "prompt": "find dentists",
            "limit": 25,
            "owner": {"email": "ops@acme.io"},
            "tags": ["a", "b"]
        }))
        .unwrap()
    }

    #[test]
    fn test_no_placeholders_is_noop() {
        let doc = json!({"workflow": {"steps": [
            {"type": "llm_call", "parameters": {"prompt": "${not_a_placeholder}", "output_keys": ["x"]}},
            {"type": "for_loop", "parameters": {"iterable": "items", "loop_variable": "i", "body": []}}
        ], "n": 3, "flag": true, "none": null}});
        assert_eq!(resolve(&doc, &ctx()).unwrap(), doc);
    }

    #[test]
    fn test_substitutes_nested_strings() {
        let doc = json!({"steps": [
            {"type": "llm_call", "parameters": {
                "prompt": "Task: ${initial_context.prompt} (max ${initial_context.limit})",
                "system_prompt": "Reply to ${ initial_context.owner.email }"
            }}
        ]});
        let resolved = resolve(&doc, &ctx()).unwrap();
        let params = &resolved["steps"][0]["parameters"];
        assert_eq!(params["prompt"], json!("Task: find dentists (max 25)"));
        assert_eq!(params["system_prompt"], json!("Reply to ops@acme.io"));
        assert_eq!(resolved["steps"][0]["type"], json!("llm_call"));
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let doc = json!(["${initial_context.tags}", "${initial_context.owner}", 7]);
        let resolved = resolve(&doc, &ctx()).unwrap();
        assert_eq!(resolved, json!([r#"["a","b"]"#, r#"{"email":"ops@acme.io"}"#, 7]));
    }

    #[test]
    fn test_missing_key_fails_with_key_name() {
        let doc = json!({"steps": [{"prompt": "hi ${initial_context.prompt} ${initial_context.nope}"}]});
        match resolve(&doc, &ctx()).unwrap_err() {
            WorkflowError::MissingPlaceholder { key } => assert_eq!(key, "nope"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_missing_nested_path() {
        let doc = json!("${initial_context.owner.phone}");
        let err = resolve(&doc, &ctx()).unwrap_err();
        assert!(err.to_string().contains("owner.phone"));
    }

    #[test]
    fn test_flat_key_containing_dot() {
        let ctx = Context::from_value(json!({"user.name": "ada", "user": {"name": "nested"}})).unwrap();
        let doc = json!({"prompt": "hi ${initial_context.user.name}"});
        assert_eq!(resolve(&doc, &ctx).unwrap(), json!({"prompt": "hi ada"}));

        let only_flat = Context::from_value(json!({"user.name": "ada"})).unwrap();
        assert_eq!(resolve(&doc, &only_flat).unwrap(), json!({"prompt": "hi ada"}));
    }

    #[test]
    fn test_mapping_keys_are_untouched() {
        let doc = json!({"${initial_context.prompt}": "v"});
        assert_eq!(resolve(&doc, &ctx()).unwrap(), doc);
    }
}
