//! Command templating.
//!
//! Every registry command string is a template over a closed variable
//! set. References to unknown variables are rejected when the registry
//! is validated, not when a plan executes; interpolated values are
//! shell-quoted so weights paths with spaces survive `sh -c`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use ih_domain::{Error, Result};
use regex::Regex;

/// The closed set of variables a registry command may reference.
pub const TEMPLATE_VARS: &[&str] = &[
    "source",
    "port",
    "host",
    "host_id",
    "model_id",
    "backend_id",
    "backend_args",
    "backend_env",
    "chat_template_args",
];

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").unwrap())
}

/// Variable names referenced by a template, in order of appearance.
pub fn referenced_vars(template: &str) -> Vec<String> {
    var_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Reject templates referencing variables outside [`TEMPLATE_VARS`].
pub fn validate_refs(template: &str) -> Result<()> {
    for var in referenced_vars(template) {
        if !TEMPLATE_VARS.contains(&var.as_str()) {
            return Err(Error::Validation(format!(
                "command template references unknown variable {{{var}}} — allowed: {}",
                TEMPLATE_VARS.join(", ")
            )));
        }
    }
    Ok(())
}

/// Interpolate a template. Values are shell-quoted, except the
/// pre-assembled argument variables which must pass through verbatim.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
    // Raw variables carry whole argument strings the operator already
    // shaped for the shell.
    const RAW: &[&str] = &["backend_args", "backend_env", "chat_template_args"];

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in var_re().captures_iter(template) {
        let m = caps.get(0).unwrap();
        let name = &caps[1];
        out.push_str(&template[last..m.start()]);
        let value = vars.get(name).ok_or_else(|| {
            Error::Validation(format!("command template references undefined variable {{{name}}}"))
        })?;
        if RAW.contains(&name) {
            out.push_str(value);
        } else {
            out.push_str(&shell_words::quote(value));
        }
        last = m.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Expand the chat-template flag for a model.
///
/// Paths (jinja extension or a path separator) use
/// `--chat-template-file`; bare names use `--chat-template`; no
/// template configured yields an empty string.
pub fn chat_template_args(chat_template: Option<&str>) -> String {
    match chat_template {
        None => String::new(),
        Some(t) if t.is_empty() => String::new(),
        Some(t) => {
            let looks_like_path = t.ends_with(".jinja") || t.contains('/') || t.contains('\\');
            if looks_like_path {
                format!("--chat-template-file {}", shell_words::quote(t))
            } else {
                format!("--chat-template {}", shell_words::quote(t))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn renders_known_vars_quoted() {
        let out = render(
            "llama-server -m {source} --port {port}",
            &vars(&[("source", "/models/my model.gguf"), ("port", "8080")]),
        )
        .unwrap();
        assert_eq!(out, "llama-server -m '/models/my model.gguf' --port 8080");
    }

    #[test]
    fn raw_vars_pass_through() {
        let out = render(
            "llama-server {backend_args}",
            &vars(&[("backend_args", "--rpc 10.0.0.2:50052 -ngl 99")]),
        )
        .unwrap();
        assert_eq!(out, "llama-server --rpc 10.0.0.2:50052 -ngl 99");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let err = render("echo {port}", &vars(&[])).unwrap_err();
        assert!(err.to_string().contains("undefined variable"));
    }

    #[test]
    fn unknown_variable_rejected_at_validation() {
        assert!(validate_refs("echo {source}").is_ok());
        assert!(validate_refs("echo {sauce}").is_err());
    }

    #[test]
    fn referenced_vars_in_order() {
        assert_eq!(
            referenced_vars("{port} {source} {port}"),
            vec!["port", "source", "port"]
        );
    }

    // ── chat_template_args ──────────────────────────────────────────

    #[test]
    fn jinja_path_uses_file_flag() {
        assert_eq!(
            chat_template_args(Some("/opt/templates/chatml.jinja")),
            "--chat-template-file /opt/templates/chatml.jinja"
        );
    }

    #[test]
    fn bare_name_uses_inline_flag() {
        assert_eq!(chat_template_args(Some("chatml")), "--chat-template chatml");
    }

    #[test]
    fn absent_template_is_empty() {
        assert_eq!(chat_template_args(None), "");
        assert_eq!(chat_template_args(Some("")), "");
    }
}
