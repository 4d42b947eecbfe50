//! Template environment built on minijinja.
//!
//! Templates are loaded from the configured directory at startup (every
//! `.html`/`.j2`/`.jinja` file, named by its relative path) and rendered
//! with serializable contexts. The endpoint layer's route helpers are
//! registered as template functions, so markup can build URLs and forms for
//! named routes:
//!
//! ```jinja
//! <a href="{{ url_for('users.show', id=user.id) }}">{{ user.name }}</a>
//! {{ form_for('users.update', id=user.id) }}
//! ```

use std::path::Path;

use minijinja::value::{Kwargs, Value};
use minijinja::Environment;
use serde::Serialize;

use crate::{config, endpoint, error::Error};

/// Wrapper around a configured minijinja environment.
pub struct Templates {
    env: Environment<'static>,
}

impl Templates {
    /// Loads every template under `path` and registers the route helpers.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut templates = Self {
            env: Environment::new(),
        };
        register_helpers(&mut templates.env);

        let root = path.as_ref();
        if root.is_dir() {
            templates.load_dir(root, root)?;
        }
        Ok(templates)
    }

    /// Environment rooted at the configured `TEMPLATES_PATH`.
    pub fn from_config() -> Result<Self, Error> {
        Self::new(config::current().templates_path.clone())
    }

    fn load_dir(&mut self, root: &Path, dir: &Path) -> Result<(), Error> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::internal(format!("failed to read template dir: {e}")))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.load_dir(root, &path)?;
                continue;
            }
            let eligible = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e, "html" | "j2" | "jinja" | "txt" | "xml"))
                .unwrap_or(false);
            if !eligible {
                continue;
            }

            let name = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            let source = std::fs::read_to_string(&path)
                .map_err(|e| Error::internal(format!("failed to read template: {e}")))?;
            self.env
                .add_template_owned(name, source)
                .map_err(|e| Error::internal(format!("invalid template: {e}")))?;
        }
        Ok(())
    }

    /// Adds a template from a string. Useful in tests and for embedded
    /// defaults.
    pub fn add(&mut self, name: &str, source: &str) -> Result<(), Error> {
        self.env
            .add_template_owned(name.to_string(), source.to_string())
            .map_err(|e| Error::internal(format!("invalid template: {e}")))
    }

    /// Renders a named template with the given context.
    pub fn render<C: Serialize>(&self, name: &str, ctx: C) -> Result<String, Error> {
        let template = self
            .env
            .get_template(name)
            .map_err(|e| Error::internal(format!("unknown template {name}: {e}")))?;
        template
            .render(ctx)
            .map_err(|e| Error::internal(format!("template {name} failed to render: {e}")))
    }
}

fn kwargs_to_pairs(kwargs: &Kwargs) -> Result<Vec<(String, String)>, minijinja::Error> {
    let mut pairs = Vec::new();
    for key in kwargs.args() {
        let value: Value = kwargs.get(key)?;
        let rendered = value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string());
        pairs.push((key.to_string(), rendered));
    }
    Ok(pairs)
}

fn helper_error(helper: &str, name: &str) -> minijinja::Error {
    minijinja::Error::new(
        minijinja::ErrorKind::InvalidOperation,
        format!("{helper}: no route named {name} (or missing parameters)"),
    )
}

fn register_helpers(env: &mut Environment<'static>) {
    env.add_function(
        "url_for",
        |name: String, kwargs: Kwargs| -> Result<String, minijinja::Error> {
            let pairs = kwargs_to_pairs(&kwargs)?;
            kwargs.assert_all_used()?;
            let params: Vec<(&str, &str)> =
                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            endpoint::path_for(&name, &params).ok_or_else(|| helper_error("url_for", &name))
        },
    );

    // The markup-producing helpers return safe strings so auto-escaping of
    // .html templates leaves them intact.
    env.add_function(
        "link_to",
        |name: String, label: String, kwargs: Kwargs| -> Result<Value, minijinja::Error> {
            let pairs = kwargs_to_pairs(&kwargs)?;
            kwargs.assert_all_used()?;
            let params: Vec<(&str, &str)> =
                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            endpoint::link_to(&name, &label, &params)
                .map(Value::from_safe_string)
                .ok_or_else(|| helper_error("link_to", &name))
        },
    );

    env.add_function(
        "form_for",
        |name: String, kwargs: Kwargs| -> Result<Value, minijinja::Error> {
            let pairs = kwargs_to_pairs(&kwargs)?;
            kwargs.assert_all_used()?;
            let params: Vec<(&str, &str)> =
                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            endpoint::form_for(&name, &params)
                .map(Value::from_safe_string)
                .ok_or_else(|| helper_error("form_for", &name))
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use serde_json::json;

    #[test]
    fn renders_templates_with_context() {
        let mut templates = Templates::new("/nonexistent").unwrap();
        templates
            .add("greeting.html", "Hello, {{ name }}!")
            .unwrap();
        assert_eq!(
            templates.render("greeting.html", json!({"name": "Ada"})).unwrap(),
            "Hello, Ada!"
        );
    }

    #[test]
    fn url_helper_resolves_registered_routes() {
        endpoint::register_path_helper("posts.show", Method::GET, "/posts/:id");
        let mut templates = Templates::new("/nonexistent").unwrap();
        templates
            .add("link.html", "{{ url_for('posts.show', id=7) }}")
            .unwrap();
        assert_eq!(templates.render("link.html", ()).unwrap(), "/posts/7");
    }

    #[test]
    fn form_helper_renders_the_override_field() {
        endpoint::register_path_helper("posts.destroy", Method::DELETE, "/posts/:id");
        let mut templates = Templates::new("/nonexistent").unwrap();
        templates
            .add("form.html", "{{ form_for('posts.destroy', id=3) }}")
            .unwrap();
        let rendered = templates.render("form.html", ()).unwrap();
        assert!(rendered.contains("action=\"/posts/3\""));
        assert!(rendered.contains("_method"));
    }

    #[test]
    fn unknown_routes_surface_as_template_errors() {
        let mut templates = Templates::new("/nonexistent").unwrap();
        templates
            .add("bad.html", "{{ url_for('missing.route') }}")
            .unwrap();
        assert!(templates.render("bad.html", ()).is_err());
    }

    #[test]
    fn templates_load_from_a_directory_tree() {
        let dir = std::env::temp_dir().join(format!("hibana-tpl-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("emails")).unwrap();
        std::fs::write(dir.join("index.html"), "index").unwrap();
        std::fs::write(dir.join("emails/welcome.html"), "welcome {{ who }}").unwrap();
        std::fs::write(dir.join("notes.md"), "ignored").unwrap();

        let templates = Templates::new(&dir).unwrap();
        assert_eq!(templates.render("index.html", ()).unwrap(), "index");
        assert_eq!(
            templates
                .render("emails/welcome.html", json!({"who": "you"}))
                .unwrap(),
            "welcome you"
        );
        assert!(templates.render("notes.md", ()).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
