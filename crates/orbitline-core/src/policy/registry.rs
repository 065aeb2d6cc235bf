//! Gauge/source registry.
//!
//! Answers, for one planning run, which committed sources compete with the
//! incoming one: per gauge (validity-window policies) or per dimension
//! signature (`insert_and_erase` mode). Lookups go to [`CommittedState`] once
//! and are cached for the rest of the run.

use std::collections::HashMap;

use uuid::Uuid;

use crate::errors::EngineResult;
use crate::model::{GaugeKey, Precedence, PrecedenceRule, SourceRecord, Span};
use crate::policy::state::CommittedState;

pub struct SourceRegistry<'s> {
    state: &'s dyn CommittedState,
    by_gauge: HashMap<GaugeKey, Vec<SourceRecord>>,
    by_signature: HashMap<String, Vec<SourceRecord>>,
}

impl<'s> SourceRegistry<'s> {
    pub fn new(state: &'s dyn CommittedState) -> Self {
        Self {
            state,
            by_gauge: HashMap::new(),
            by_signature: HashMap::new(),
        }
    }

    pub fn sources_for_gauge(&mut self, gauge: &GaugeKey) -> EngineResult<&[SourceRecord]> {
        if !self.by_gauge.contains_key(gauge) {
            let found = self.state.sources_for_gauge(gauge)?;
            self.by_gauge.insert(gauge.clone(), found);
        }
        Ok(self.by_gauge.get(gauge).map(Vec::as_slice).unwrap_or_default())
    }

    pub fn sources_for_signature(&mut self, dim_signature: &str) -> EngineResult<&[SourceRecord]> {
        if !self.by_signature.contains_key(dim_signature) {
            let found = self.state.sources_for_signature(dim_signature)?;
            self.by_signature.insert(dim_signature.to_string(), found);
        }
        Ok(self
            .by_signature
            .get(dim_signature)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    /// Validity windows of the sources of `gauge` that beat `incoming`.
    pub fn stronger_windows_for_gauge(
        &mut self,
        gauge: &GaugeKey,
        incoming: &Precedence,
        rule: PrecedenceRule,
        exclude: Uuid,
    ) -> EngineResult<Vec<Span>> {
        let sources = self.sources_for_gauge(gauge)?;
        Ok(stronger_windows(sources, incoming, rule, exclude))
    }

    /// Validity windows of the sources of `dim_signature` that beat `incoming`.
    pub fn stronger_windows_for_signature(
        &mut self,
        dim_signature: &str,
        incoming: &Precedence,
        rule: PrecedenceRule,
        exclude: Uuid,
    ) -> EngineResult<Vec<Span>> {
        let sources = self.sources_for_signature(dim_signature)?;
        Ok(stronger_windows(sources, incoming, rule, exclude))
    }
}

fn stronger_windows(
    sources: &[SourceRecord],
    incoming: &Precedence,
    rule: PrecedenceRule,
    exclude: Uuid,
) -> Vec<Span> {
    let mut out: Vec<Span> = sources
        .iter()
        .filter(|s| s.id != exclude && rule.stronger(&s.precedence(), incoming))
        .filter_map(|s| s.validity)
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceIdentity, SourceStatus};
    use crate::policy::state::MemoryState;
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn source(n: u128, priority: i64, generated: OffsetDateTime, window: Span) -> SourceRecord {
        SourceRecord {
            id: Uuid::from_u128(n),
            identity: SourceIdentity {
                name: format!("S{n}"),
                dim_signature: "SIG".into(),
                processor: "exec".into(),
                version: "1".into(),
            },
            validity: Some(window),
            reported_validity: Some(window),
            generation_time: Some(generated),
            reception_time: Some(generated),
            ingestion_time: generated,
            priority,
            status: SourceStatus::Ok,
            error_kind: None,
            error_message: None,
            digest: None,
        }
    }

    #[test]
    fn only_stronger_sources_contribute_windows() {
        let w1 = Span::new(datetime!(2020-01-01 00:00 UTC), datetime!(2020-01-01 06:00 UTC));
        let w2 = Span::new(datetime!(2020-01-01 03:00 UTC), datetime!(2020-01-01 09:00 UTC));
        let mut state = MemoryState::new();
        let strong = source(1, 30, datetime!(2020-01-01 00:00 UTC), w1);
        let weak = source(2, 10, datetime!(2020-01-05 00:00 UTC), w2);
        state.sources.insert(strong.id, strong);
        state.sources.insert(weak.id, weak);

        let incoming = Precedence {
            priority: 20,
            generation_time: datetime!(2020-01-03 00:00 UTC),
        };
        let mut reg = SourceRegistry::new(&state);
        let by_priority = reg
            .stronger_windows_for_signature("SIG", &incoming, PrecedenceRule::PriorityThenGeneration, Uuid::nil())
            .unwrap();
        assert_eq!(by_priority, vec![w1]);

        let by_generation = reg
            .stronger_windows_for_signature("SIG", &incoming, PrecedenceRule::GenerationOnly, Uuid::nil())
            .unwrap();
        assert_eq!(by_generation, vec![w2]);
    }
}
