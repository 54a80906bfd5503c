//! Playbooks: a named list of templated tasks run in order against one host.
//!
//! This is deliberately small. Tasks either run a command or write a file
//! from a template embedded in the playbook. `{{ name }}` and
//! `{{ registered.field }}` placeholders are substituted from the playbook's
//! variables, the caller's overrides, and results registered by earlier
//! tasks; placeholders that resolve to nothing are left as written. `when`
//! supports `a == b`, `a != b` and bare truthiness, nothing more.

use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;

use crate::log::*;
use crate::shell::ShellCommand;

pub mod visitor;

pub use visitor::{RenderingTaskVisitor, TaskVisitor};

pub type Vars = Map<String, Value>;

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    name: String,
    #[serde(default)]
    vars: Vars,
    tasks: Vec<Task>,
    #[serde(default)]
    templates: Vec<Template>,
}

impl Playbook {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            vars: Vars::new(),
            tasks: vec![],
            templates: vec![],
        }
    }

    #[tracing::instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .wrap_err("Failed reading playbook")?;
        serde_yaml::from_str(&raw).wrap_err("deserializing playbook")
    }

    #[tracing::instrument(skip(self))]
    pub fn add_task(&mut self, task: Task) {
        debug!("playbook: added task: {}", task.name());
        self.tasks.push(task);
    }

    pub fn add_template(&mut self, template: Template) {
        self.templates.push(template);
    }

    /// Find a template by the `src` a task refers to it with:
    /// `templates/inputs.conf.j2`, `inputs.conf.j2` and `inputs.conf` all
    /// name the same template.
    pub fn template(&self, src: &str) -> Option<&Template> {
        let wanted = src.rsplit('/').next().unwrap_or(src);
        let bare = wanted.trim_end_matches(".j2");
        self.templates
            .iter()
            .find(|t| t.name == wanted || t.name.trim_end_matches(".j2") == bare)
    }

    /// Structural problems, empty when the playbook can be run.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = vec![];
        if self.name.trim().is_empty() {
            problems.push("playbook has no name".to_string());
        }
        if self.tasks.is_empty() {
            problems.push("playbook has no tasks".to_string());
        }
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.name.trim().is_empty() {
                problems.push(format!("task #{} has no name", idx + 1));
            }
            if let Action::Template { template } = &task.action {
                if self.template(&template.src).is_none() {
                    problems.push(format!(
                        "task `{}` refers to unknown template `{}`",
                        task.name, template.src
                    ));
                }
            }
            if let Some(register) = &task.register {
                if register.is_empty()
                    || !register.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    problems.push(format!(
                        "task `{}` registers an invalid name `{}`",
                        task.name, register
                    ));
                }
            }
        }
        problems
    }

    /// Render every task up front, without registered results. Tasks whose
    /// `when` depends on a registered result are judged as if it were absent.
    #[tracing::instrument(skip(self, overrides))]
    pub fn plan(&self, overrides: &Vars) -> Result<Vec<PlannedTask>> {
        let mut visitor = RenderingTaskVisitor::new(self, overrides)?;
        let mut planned = vec![];
        for task in self.tasks.iter() {
            if let Some(task) = visitor.visit_task(task)? {
                planned.push(task);
            }
        }
        debug!("playbook {}: planned {} task(s)", self.name, planned.len());
        Ok(planned)
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    name: String,
    #[serde(flatten)]
    action: Action,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    register: Option<String>,
    #[serde(default)]
    become_user: Option<String>,
    /// Seconds.
    #[serde(default)]
    timeout: Option<u64>,
}

impl Task {
    pub fn command<N: Into<String>, C: Into<String>>(name: N, command: C) -> Self {
        Self::with_action(
            name,
            Action::Command {
                command: command.into(),
            },
        )
    }

    pub fn template<N: Into<String>, S: Into<String>, D: Into<String>>(name: N, src: S, dest: D) -> Self {
        Self::with_action(
            name,
            Action::Template {
                template: TemplateTarget {
                    src: src.into(),
                    dest: dest.into(),
                    mode: None,
                },
            },
        )
    }

    fn with_action<N: Into<String>>(name: N, action: Action) -> Self {
        Self {
            name: name.into(),
            action,
            when: None,
            register: None,
            become_user: None,
            timeout: None,
        }
    }

    pub fn when<S: Into<String>>(mut self, condition: S) -> Self {
        self.when = Some(condition.into());
        self
    }

    pub fn register<S: Into<String>>(mut self, name: S) -> Self {
        self.register = Some(name.into());
        self
    }

    pub fn become_user<S: Into<String>>(mut self, user: S) -> Self {
        self.become_user = Some(user.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Command { command: String },
    Template { template: TemplateTarget },
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct TemplateTarget {
    src: String,
    dest: String,
    /// Octal file mode such as `0644`.
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    name: String,
    content: String,
}

impl Template {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, content: C) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// A task with its placeholders resolved, ready to run.
#[derive(Getters, Debug, Clone)]
pub struct PlannedTask {
    name: String,
    command: ShellCommand,
    register: Option<String>,
    timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;
    use serde_json::json;

    use super::*;

    const PLAYBOOK: &str = r#"
name: forwarder inputs
vars:
  splunk_home: /opt/splunkforwarder
  index: main
tasks:
  - name: check home
    command: test -d {{ splunk_home }}
    register: home
  - name: write inputs
    template:
      src: templates/inputs.conf.j2
      dest: "{{ splunk_home }}/etc/system/local/inputs.conf"
    when: home.success == true
  - name: restart
    command: "{{ splunk_home }}/bin/splunk restart"
    become_user: splunk
    timeout: 120
templates:
  - name: inputs.conf.j2
    content: |
      [monitor:///var/log]
      index = {{ index }}
"#;

    #[test]
    fn test_playbook_parses_both_task_kinds() -> Result<()> {
        let playbook: Playbook = serde_yaml::from_str(PLAYBOOK)?;
        assert_eq!(3, playbook.tasks().len());
        assert!(matches!(playbook.tasks()[0].action(), Action::Command { .. }));
        assert!(matches!(playbook.tasks()[1].action(), Action::Template { .. }));
        assert_eq!(Some(120), *playbook.tasks()[2].timeout());
        assert!(playbook.validate().is_empty());
        assert!(playbook.template("inputs.conf").is_some());
        Ok(())
    }

    #[test]
    fn test_unknown_template_is_a_problem() {
        let mut playbook = Playbook::new("broken");
        playbook.add_task(Task::template("write", "templates/missing.j2", "/tmp/x"));
        let problems = playbook.validate();
        assert_eq!(1, problems.len());
        assert!(problems[0].contains("missing.j2"));
    }

    #[test]
    fn test_plan_renders_every_applicable_task() -> Result<()> {
        let playbook: Playbook = serde_yaml::from_str(PLAYBOOK)?;
        let overrides = json!({"splunk_home": "/srv/uf"});
        let planned = playbook.plan(overrides.as_object().expect("object"))?;
        // `home` is never registered while planning, so the template is skipped.
        assert_eq!(2, planned.len());
        assert_eq!("sh -c 'test -d /srv/uf'", planned[0].command().render());
        assert_eq!(Some(Duration::from_secs(120)), *planned[1].timeout());
        assert!(planned[1]
            .command()
            .render()
            .starts_with("su - splunk -c "));
        Ok(())
    }
}
