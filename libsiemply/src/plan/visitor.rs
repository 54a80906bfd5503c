//! A visitor for a [`Task`] in a [`Playbook`]. Task visitors are used to do
//! things like render a task into the command it runs.

use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use regex::{Captures, Regex};
use serde_json::{json, Value};

use super::{Action, PlannedTask, Playbook, Task, Vars};
use crate::executor::CommandResult;
use crate::log::*;
use crate::shell::ShellCommand;

const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\}\}";

/// A visitor for a [`Task`] in a [`Playbook`].
pub trait TaskVisitor: Send + std::fmt::Debug {
    /// The output type of this visitor.
    type Out;

    /// Visit the given task.
    fn visit_task(&mut self, task: &Task) -> Result<Self::Out>;
}

/// Renders a [`Task`] into a [`PlannedTask`], or `None` when its `when`
/// condition does not hold. Keeps the variables, including results
/// registered along the way.
#[derive(Debug, Clone)]
pub struct RenderingTaskVisitor<'a> {
    playbook: &'a Playbook,
    vars: Vars,
    placeholder: Regex,
}

impl<'a> RenderingTaskVisitor<'a> {
    /// Start from the playbook's own variables with `overrides` on top.
    pub fn new(playbook: &'a Playbook, overrides: &Vars) -> Result<Self> {
        let mut vars = playbook.vars().clone();
        for (key, value) in overrides {
            vars.insert(key.clone(), value.clone());
        }
        Ok(Self {
            playbook,
            vars,
            placeholder: Regex::new(PLACEHOLDER)?,
        })
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn set<S: Into<String>>(&mut self, name: S, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Make `result` available as `{{ name.success }}`, `{{ name.stdout }}`,
    /// `{{ name.stderr }}` and `{{ name.return_code }}`.
    pub fn register(&mut self, name: &str, result: &CommandResult) {
        self.set(
            name,
            json!({
                "success": result.success(),
                "return_code": result.exit_code(),
                "stdout": result.stdout().trim_end(),
                "stderr": result.stderr().trim_end(),
            }),
        );
    }

    /// Substitute placeholders. Unknown ones stay verbatim.
    pub fn render(&self, text: &str) -> String {
        self.placeholder
            .replace_all(text, |caps: &Captures| match lookup(&self.vars, &caps[1]) {
                Some(value) => display(value),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Evaluate a `when` expression.
    pub fn holds(&self, condition: &str) -> bool {
        let (name, expected, negate) = if let Some((lhs, rhs)) = condition.split_once("!=") {
            (lhs, Some(rhs), true)
        } else if let Some((lhs, rhs)) = condition.split_once("==") {
            (lhs, Some(rhs), false)
        } else {
            (condition, None, false)
        };

        let name = name.trim().trim_start_matches("{{").trim_end_matches("}}").trim();
        let actual = lookup(&self.vars, name);
        match expected {
            Some(expected) => {
                let expected = expected.trim().trim_matches(|c| c == '"' || c == '\'');
                let actual = actual.map(display).unwrap_or_default();
                (actual == expected) != negate
            }
            None => actual.map(truthy).unwrap_or(false),
        }
    }
}

impl<'a> TaskVisitor for RenderingTaskVisitor<'a> {
    type Out = Option<PlannedTask>;

    #[tracing::instrument(skip(self), fields(task = %task.name()))]
    fn visit_task(&mut self, task: &Task) -> Result<Self::Out> {
        if let Some(condition) = task.when() {
            if !self.holds(condition) {
                debug!("skipping task {}: `{}` is false", task.name(), condition);
                return Ok(None);
            }
        }

        let mut command = match task.action() {
            Action::Command { command } => ShellCommand::shell(self.render(command)),
            Action::Template { template } => {
                let source = self.playbook.template(template.src()).ok_or_else(|| {
                    eyre!("template {} not found in playbook", template.src())
                })?;
                let dest = self.render(template.dest());
                let dir = Path::new(&dest)
                    .parent()
                    .map(|p| p.display().to_string())
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "/".to_string());
                let content = self.render(source.content().trim_end_matches('\n'));
                let mut write = ShellCommand::new("mkdir")
                    .args(["-p", &dir])
                    .and(ShellCommand::write_file(dest.as_str(), content));
                if let Some(mode) = template.mode() {
                    write = write.and(ShellCommand::new("chmod").args([mode.as_str(), &dest]));
                }
                write
            }
        };
        if let Some(user) = task.become_user() {
            command = command.as_user(self.render(user));
        }

        Ok(Some(PlannedTask {
            name: self.render(task.name()),
            command,
            register: task.register().clone(),
            timeout: task.timeout().map(Duration::from_secs),
        }))
    }
}

fn lookup<'v>(vars: &'v Vars, path: &str) -> Option<&'v Value> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;
    use serde_json::json;

    use super::*;
    use crate::plan::Template;

    fn visitor(playbook: &Playbook) -> Result<RenderingTaskVisitor<'_>> {
        let overrides = json!({"user": "splunk", "port": 9997});
        RenderingTaskVisitor::new(playbook, overrides.as_object().expect("object"))
    }

    #[test]
    fn test_unknown_placeholders_stay_verbatim() -> Result<()> {
        let playbook = Playbook::new("t");
        let visitor = visitor(&playbook)?;
        assert_eq!(
            "listen 9997 as splunk for {{ nobody }}",
            visitor.render("listen {{port}} as {{ user }} for {{ nobody }}")
        );
        Ok(())
    }

    #[test]
    fn test_conditions_read_registered_results() -> Result<()> {
        let playbook = Playbook::new("t");
        let mut visitor = visitor(&playbook)?;
        assert!(!visitor.holds("check.success == true"));
        assert!(visitor.holds("check.success != true"));

        visitor.register("check", &CommandResult::new(0, "active\n", ""));
        assert!(visitor.holds("check.success == true"));
        assert!(visitor.holds("check.stdout == 'active'"));
        assert!(visitor.holds("check.success"));
        assert!(!visitor.holds("missing"));
        Ok(())
    }

    #[test]
    fn test_template_task_writes_rendered_file() -> Result<()> {
        let mut playbook = Playbook::new("t");
        playbook.add_template(Template::new("outputs.conf.j2", "[tcpout]\nport = {{ port }}\n"));
        let mut visitor = visitor(&playbook)?;
        let planned = visitor
            .visit_task(&Task::template(
                "outputs",
                "templates/outputs.conf.j2",
                "/opt/uf/etc/outputs.conf",
            ))?
            .expect("task applies");
        assert_eq!(
            "mkdir -p /opt/uf/etc && printf '%s\\n' '[tcpout]\nport = 9997' > /opt/uf/etc/outputs.conf",
            planned.command().render()
        );
        Ok(())
    }

    #[test]
    fn test_become_user_is_rendered() -> Result<()> {
        let playbook = Playbook::new("t");
        let mut visitor = visitor(&playbook)?;
        let planned = visitor
            .visit_task(&Task::command("who", "whoami").become_user("{{ user }}"))?
            .expect("task applies");
        assert_eq!("su - splunk -c 'sh -c whoami'", planned.command().render());
        Ok(())
    }
}
