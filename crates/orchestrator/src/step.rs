//! Step trait: the unit of work every batch and fan-out operates on.
//!
//! A step owns a [`StepReport`]. `execute` and `verify` never return an
//! error; whatever goes wrong inside them is recorded in the report, which
//! the owner reads after the call returns.

use async_trait::async_trait;
use conductor_core::StepReport;
use events::{Event, Stage};
use tracing::{debug, info_span, Instrument};

use crate::context::StepContext;

#[async_trait]
pub trait Step: Send {
    /// Human-readable name, derived from the concrete type by default.
    fn name(&self) -> String {
        short_type_name::<Self>()
    }

    /// Perform the side-effecting work.
    async fn execute(&mut self, ctx: &StepContext);

    /// Read-only recheck of the end state. Most steps leave this empty.
    async fn verify(&mut self, _ctx: &StepContext) {}

    fn report(&self) -> &StepReport;

    fn report_mut(&mut self) -> &mut StepReport;
}

/// Run `execute` then `verify`, emitting progress events around each half.
pub async fn run_step(step: &mut dyn Step, ctx: &StepContext) {
    let name = step.name();
    let span = info_span!("step", name = %name);

    async {
        run_stage(step, ctx, &name, Stage::Execute).await;
        run_stage(step, ctx, &name, Stage::Verify).await;
    }
    .instrument(span)
    .await
}

async fn run_stage(step: &mut dyn Step, ctx: &StepContext, name: &str, stage: Stage) {
    ctx.emit(Event::StepStarted {
        step: name.to_string(),
        stage,
    });

    match stage {
        Stage::Execute => step.execute(ctx).await,
        Stage::Verify => step.verify(ctx).await,
    }

    let exceptions = step.report().exceptions.len();
    debug!(stage = stage.as_str(), exceptions, "Stage finished");
    ctx.emit(Event::StepFinished {
        step: name.to_string(),
        stage,
        exceptions,
    });
}

/// `crate::module::Thing<T>` becomes `Thing`.
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::Status;
    use events::EventBus;

    struct Tracer {
        report: StepReport,
        calls: Vec<&'static str>,
    }

    #[async_trait]
    impl Step for Tracer {
        async fn execute(&mut self, _ctx: &StepContext) {
            self.calls.push("execute");
            self.report.record_exception("boom");
        }

        async fn verify(&mut self, _ctx: &StepContext) {
            self.calls.push("verify");
            self.report.set_result("tracer", Status::Fail);
        }

        fn report(&self) -> &StepReport {
            &self.report
        }

        fn report_mut(&mut self) -> &mut StepReport {
            &mut self.report
        }
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Tracer>(), "Tracer");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }

    #[tokio::test]
    async fn test_run_step_calls_both_halves() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let ctx = StepContext::new().with_event_bus(bus);
        let mut tracer = Tracer {
            report: StepReport::new(),
            calls: Vec::new(),
        };

        run_step(&mut tracer, &ctx).await;

        assert_eq!(tracer.calls, vec!["execute", "verify"]);
        assert_eq!(tracer.report.exceptions, vec!["boom".to_string()]);
        assert_eq!(tracer.report.results.status("tracer"), Some(Status::Fail));

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first.event,
            Event::StepStarted { ref step, stage: Stage::Execute } if step == "Tracer"
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.event, Event::StepFinished { exceptions: 1, .. }));
    }
}
