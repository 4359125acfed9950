//! URL template rendering for collectors.
//!
//! Supports `{{ params.owner }}`, `{{ input.iid }}` and `{{ pager.page }}`
//! style expressions. A leading dot and a capitalized root are accepted too,
//! so `{{ .Params.ProjectId }}` resolves against the `ProjectId` param.

use serde_json::Value;

use crate::error::CollectorError;

/// Values available to a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub params: Value,
    pub input: Value,
    pub pager: Value,
}

/// Render template expressions in a string, replacing `{{ ... }}` patterns.
pub fn render_string(template: &str, ctx: &TemplateContext) -> Result<String, CollectorError> {
    let mut result = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or_else(|| CollectorError::Template {
                message: format!("Unclosed template expression in: {template}"),
            })?;
        let expr = after_open[..end].trim();
        let value = resolve_expression(expr, ctx)?;
        result.push_str(&value_to_string(&value));
        rest = &after_open[end + 2..];
    }
    result.push_str(rest);

    Ok(result)
}

/// Resolve a dotted expression like `params.owner` or `input.parent.id`.
fn resolve_expression(expr: &str, ctx: &TemplateContext) -> Result<Value, CollectorError> {
    let expr = expr.trim_start_matches('.');
    let mut parts = expr.split('.');
    let root = match parts.next().map(str::to_ascii_lowercase).as_deref() {
        Some("params") => &ctx.params,
        Some("input") => &ctx.input,
        Some("pager") => &ctx.pager,
        _ => {
            return Err(CollectorError::Template {
                message: format!("Unknown template root in '{expr}'"),
            });
        }
    };

    let mut current = root;
    for key in parts {
        current = current.get(key).ok_or_else(|| CollectorError::Template {
            message: format!("'{expr}' not found"),
        })?;
    }
    if current.is_null() {
        return Err(CollectorError::Template {
            message: format!("'{expr}' is null"),
        });
    }
    Ok(current.clone())
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TemplateContext {
        TemplateContext {
            params: json!({"owner": "apache", "repo": "lake", "ProjectId": 12}),
            input: json!({"iid": 7, "parent": {"id": "abc"}}),
            pager: json!({"page": 3, "size": 100, "skip": 200}),
        }
    }

    #[test]
    fn test_render_params_and_pager() {
        let url = render_string("repos/{{ params.owner }}/{{ params.repo }}/issues", &ctx()).unwrap();
        assert_eq!(url, "repos/apache/lake/issues");
        assert_eq!(render_string("p{{pager.page}}", &ctx()).unwrap(), "p3");
    }

    #[test]
    fn test_render_go_style_roots() {
        let url = render_string(
            "projects/{{ .Params.ProjectId }}/merge_requests/{{ .Input.iid }}/commits",
            &ctx(),
        )
        .unwrap();
        assert_eq!(url, "projects/12/merge_requests/7/commits");
    }

    #[test]
    fn test_render_nested_input() {
        assert_eq!(
            render_string("items/{{ input.parent.id }}", &ctx()).unwrap(),
            "items/abc"
        );
    }

    #[test]
    fn test_render_errors() {
        assert!(matches!(
            render_string("x/{{ params.missing }}", &ctx()),
            Err(CollectorError::Template { .. })
        ));
        assert!(render_string("x/{{ params.owner", &ctx()).is_err());
        assert!(render_string("x/{{ env.HOME }}", &ctx()).is_err());
        let empty = TemplateContext::default();
        assert!(render_string("{{ input.iid }}", &empty).is_err());
    }

    #[test]
    fn test_render_without_expressions() {
        assert_eq!(render_string("issues/search", &ctx()).unwrap(), "issues/search");
    }
}
