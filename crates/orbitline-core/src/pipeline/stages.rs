//! Built-in pipeline stages.
//!
//! Each stage is a thin wrapper around one module:
//! - [`ValidateStage`]: `Submitted -> Validated` (`pipeline::validate`)
//! - [`ResolveStage`]: `Validated -> Resolved` (`pipeline::resolve`)
//! - [`ApplyStage`]: `Resolved -> Applied` (`policy`), needs committed state
//! - [`VerifyPlanStage`]: `Applied -> Applied` (`pipeline::verify`)
//!
//! Stages avoid any filesystem/network I/O.

use crate::errors::EngineResult;
use crate::pipeline::{resolve, unexpected, validate, verify};
use crate::pipeline::{OperationState, PipelineContext, PipelineData, Stage};
use crate::policy;

pub struct ValidateStage;

impl Stage for ValidateStage {
    fn id(&self) -> &str {
        "validate"
    }

    fn reaches(&self) -> Option<OperationState> {
        Some(OperationState::Validated)
    }

    fn run(&self, ctx: &mut PipelineContext<'_>, input: PipelineData) -> EngineResult<PipelineData> {
        match input {
            PipelineData::Submitted(sub) => {
                let op = validate::validate_operation(ctx, *sub)?;
                ctx.push_info(
                    "operation.validated",
                    format!("{} events, {} annotations", op.events.len(), op.annotations.len()),
                );
                Ok(PipelineData::Validated(Box::new(op)))
            }
            other => Err(unexpected("Submitted", &other)),
        }
    }
}

pub struct ResolveStage;

impl Stage for ResolveStage {
    fn id(&self) -> &str {
        "resolve"
    }

    fn reaches(&self) -> Option<OperationState> {
        Some(OperationState::Resolved)
    }

    fn run(&self, ctx: &mut PipelineContext<'_>, input: PipelineData) -> EngineResult<PipelineData> {
        let op = input.into_validated()?;
        let resolved = resolve::resolve_operation(op)?;
        ctx.push_info(
            "operation.resolved",
            format!("{} event links, {} explicit references", resolved.links.len(), resolved.explicit_refs.len()),
        );
        Ok(PipelineData::Resolved(Box::new(resolved)))
    }
}

pub struct ApplyStage;

impl Stage for ApplyStage {
    fn id(&self) -> &str {
        "apply"
    }

    fn reaches(&self) -> Option<OperationState> {
        Some(OperationState::Applied)
    }

    fn run(&self, ctx: &mut PipelineContext<'_>, input: PipelineData) -> EngineResult<PipelineData> {
        let resolved = input.into_resolved()?;
        let plan = policy::plan_operation(ctx, resolved)?;
        Ok(PipelineData::Applied(Box::new(plan)))
    }
}

pub struct VerifyPlanStage;

impl Stage for VerifyPlanStage {
    fn id(&self) -> &str {
        "verify"
    }

    fn run(&self, ctx: &mut PipelineContext<'_>, input: PipelineData) -> EngineResult<PipelineData> {
        let plan = input.into_plan()?;
        let report = verify::verify_plan(&plan);
        for f in report.findings.iter().filter(|f| f.level == verify::VerifyLevel::Warning) {
            ctx.push_warning(f.code.clone(), f.message.clone());
        }
        report.into_result()?;
        Ok(PipelineData::Applied(Box::new(plan)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::errors::EngineError;
    use crate::pipeline::parse::decode_operation;
    use crate::pipeline::{Pipeline, SequentialIds};
    use crate::policy::MemoryState;
    use crate::timestamp::parse_timestamp;
    use assert_matches::assert_matches;

    fn submitted() -> PipelineData {
        let v = serde_json::json!({
            "dim_signature": {"name": "S2A_PLAN", "exec": "ingest_nppf", "version": "1.0"},
            "source": {
                "name": "NPPF.xml",
                "generation_time": "2018-06-05T02:07:03",
                "validity_start": "2018-06-05T00:00:00",
                "validity_stop": "2018-06-06T00:00:00"
            },
            "events": [{
                "link_ref": "IMG",
                "gauge": {"name": "PLANNED_CUT_IMAGING", "system": "S2A", "insertion_type": "INSERT"},
                "start": "2018-06-05T02:00:00",
                "stop": "2018-06-05T02:10:00",
                "values": [{"name": "imaging_mode", "type": "text", "value": "NOMINAL"}]
            }, {
                "gauge": {"name": "PLANNED_PLAYBACK", "system": "S2A", "insertion_type": "INSERT"},
                "start": "2018-06-05T03:00:00",
                "stop": "2018-06-05T03:05:00",
                "links": [{"link": "IMG", "link_mode": "by_ref", "name": "IMAGING", "back_ref": "PLAYBACK"}]
            }]
        });
        PipelineData::Submitted(Box::new(decode_operation(v).unwrap()))
    }

    #[test]
    fn validation_then_planning_produces_a_plan() {
        let cfg = EngineConfig::default();
        let now = parse_timestamp("2018-06-06T00:00:00").unwrap();
        let mut ctx = PipelineContext::new(&cfg, now);
        let validated = Pipeline::validation().run(&mut ctx, submitted()).unwrap();
        assert_eq!(ctx.reached, OperationState::Validated);

        let state = MemoryState::new();
        let mut planning = PipelineContext::new(&cfg, now)
            .with_state(&state)
            .with_ids(SequentialIds::starting_at(0));
        let plan = Pipeline::planning()
            .run(&mut planning, validated)
            .unwrap()
            .into_plan()
            .unwrap();
        assert_eq!(planning.reached, OperationState::Applied);
        assert_eq!(plan.insert_events.len(), 2);
        assert_eq!(plan.insert_links.len(), 2);
        assert_eq!(plan.gauges.len(), 2);
    }

    #[test]
    fn apply_without_state_is_an_invariant_error() {
        let cfg = EngineConfig::default();
        let now = parse_timestamp("2018-06-06T00:00:00").unwrap();
        let mut ctx = PipelineContext::new(&cfg, now);
        let validated = Pipeline::validation().run(&mut ctx, submitted()).unwrap();
        let r = Pipeline::planning().run(&mut ctx, validated);
        assert_matches!(r, Err(EngineError::Invariant(_)));
    }

    #[test]
    fn wrong_input_variant_is_rejected() {
        let cfg = EngineConfig::default();
        let mut ctx = PipelineContext::new(&cfg, time::OffsetDateTime::UNIX_EPOCH);
        let r = ValidateStage.run(&mut ctx, PipelineData::None);
        assert_matches!(r, Err(EngineError::Invariant(_)));
    }
}
