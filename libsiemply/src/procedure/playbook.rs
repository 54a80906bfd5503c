use super::params::PlaybookSpec;
use super::step::{Finish, Halt, StepContext};
use crate::config::EngineConfig;
use crate::plan::{RenderingTaskVisitor, TaskVisitor};

/// Run a playbook's tasks in order. Conditions see results registered by
/// earlier tasks; the first failing task halts the run.
pub(crate) async fn playbook(
    ctx: &mut StepContext<'_>,
    spec: &PlaybookSpec,
    config: &EngineConfig,
) -> Result<Finish, Halt> {
    let playbook = &spec.playbook;
    let mut visitor = RenderingTaskVisitor::new(playbook, &spec.vars)
        .map_err(|err| Halt::failed("render", err.to_string()))?;
    visitor.set("is_dry_run", ctx.is_dry_run().into());

    let mut ran = 0;
    let mut skipped = 0;
    for task in playbook.tasks() {
        let planned = visitor
            .visit_task(task)
            .map_err(|err| Halt::failed(task.name().as_str(), err.to_string()))?;
        let Some(planned) = planned else {
            skipped += 1;
            continue;
        };
        let timeout = planned.timeout().unwrap_or_else(|| config.timeouts.command());
        let result = ctx.run_for(planned.name(), planned.command(), timeout).await?;
        if let Some(name) = planned.register() {
            visitor.register(name, &result);
        }
        ctx.capture(&result);
        ran += 1;
    }

    Ok(Finish::done(format!(
        "playbook `{}`: {} task(s) run, {} skipped",
        playbook.name(),
        ran,
        skipped
    )))
}
